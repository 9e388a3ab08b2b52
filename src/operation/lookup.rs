//! Talking to the master: volume lookup, topology, heartbeats and the
//! cluster admin lock.

use crate::common::topology::{EcShardInfo, TopologyResponse, VolumeInfo};
use crate::common::{LockBackend, Location, Result, VolumeId};
use crate::operation::{check_response, http_base};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the replicas of a volume currently live. Answers may be stale.
#[async_trait]
pub trait LocationDirectory: Send + Sync {
    async fn lookup_volume(&self, volume_id: VolumeId) -> Result<Vec<Location>>;
}

/// Live cluster layout for the placement commands.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn topology_info(&self) -> Result<TopologyResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// Periodic report of a volume server to the master.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    pub url: String,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub data_center: String,
    #[serde(default)]
    pub rack: String,
    pub max_volume_count: u64,
    #[serde(default)]
    pub volumes: Vec<VolumeInfo>,
    #[serde(default)]
    pub ec_shards: Vec<EcShardInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub volume_size_limit_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub lease_ms: u64,
}

/// HTTP client for the master
#[derive(Clone)]
pub struct MasterClient {
    base_url: String,
    http: reqwest::Client,
}

impl MasterClient {
    pub fn new(master: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: http_base(master),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatResponse> {
        let resp = self
            .http
            .post(format!("{}/cluster/heartbeat", self.base_url))
            .json(heartbeat)
            .send()
            .await?;
        Ok(check_response(resp).await?.json().await?)
    }
}

#[async_trait]
impl LocationDirectory for MasterClient {
    async fn lookup_volume(&self, volume_id: VolumeId) -> Result<Vec<Location>> {
        let resp = self
            .http
            .get(format!("{}/dir/lookup", self.base_url))
            .query(&[("volumeId", volume_id.to_string())])
            .send()
            .await?;
        let lookup: LookupResponse = check_response(resp).await?.json().await?;
        Ok(lookup.locations)
    }
}

#[async_trait]
impl TopologySource for MasterClient {
    async fn topology_info(&self) -> Result<TopologyResponse> {
        let resp = self
            .http
            .get(format!("{}/cluster/topology", self.base_url))
            .send()
            .await?;
        Ok(check_response(resp).await?.json().await?)
    }
}

#[async_trait]
impl LockBackend for MasterClient {
    async fn acquire(&self, owner: &str) -> Result<Duration> {
        let resp = self
            .http
            .post(format!("{}/cluster/lock", self.base_url))
            .json(&LockRequest {
                owner: owner.to_string(),
            })
            .send()
            .await?;
        let lease: LockResponse = check_response(resp).await?.json().await?;
        Ok(Duration::from_millis(lease.lease_ms))
    }

    async fn release(&self, owner: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/cluster/unlock", self.base_url))
            .json(&LockRequest {
                owner: owner.to_string(),
            })
            .send()
            .await?;
        check_response(resp).await?;
        Ok(())
    }
}
