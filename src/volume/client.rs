//! Admin RPCs against volume servers (freeze, shard generation, shard
//! copy/mount/unmount/delete)

use crate::common::ec::ShardId;
use crate::common::{verify_blake3, Error, Result, VolumeId};
use crate::operation::{check_response, http_base};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// Response header carrying the BLAKE3 digest of a shard body.
pub const SHARD_DIGEST_HEADER: &str = "X-Shard-Blake3";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub volume_id: VolumeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub collection: String,
    /// `xyz` replica placement
    #[serde(default)]
    pub replication: String,
    #[serde(default)]
    pub ttl: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateEcShardsRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcShardsRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub collection: String,
    pub shard_ids: Vec<ShardId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyEcShardsRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub collection: String,
    pub shard_ids: Vec<ShardId>,
    /// `ip:port` of the server holding the shards
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyEcShardsResponse {
    pub shard_ids: Vec<ShardId>,
}

/// Volume-server side effects driven by the placement commands.
/// `server` is always the `ip:port` of the server to act on.
#[async_trait]
pub trait VolumeAdmin: Send + Sync {
    async fn mark_readonly(&self, server: &str, volume_id: VolumeId) -> Result<()>;

    async fn mark_writable(&self, server: &str, volume_id: VolumeId) -> Result<()>;

    async fn generate_ec_shards(&self, server: &str, volume_id: VolumeId, collection: &str) -> Result<()>;

    /// Ask `target` to pull `shard_ids` from `source`. Returns the ids copied.
    async fn copy_ec_shards(
        &self,
        target: &str,
        volume_id: VolumeId,
        collection: &str,
        shard_ids: &[ShardId],
        source: &str,
    ) -> Result<Vec<ShardId>>;

    async fn mount_ec_shards(
        &self,
        server: &str,
        volume_id: VolumeId,
        collection: &str,
        shard_ids: &[ShardId],
    ) -> Result<()>;

    async fn unmount_ec_shards(&self, server: &str, volume_id: VolumeId, shard_ids: &[ShardId]) -> Result<()>;

    async fn delete_ec_shards(
        &self,
        server: &str,
        volume_id: VolumeId,
        collection: &str,
        shard_ids: &[ShardId],
    ) -> Result<()>;

    async fn delete_volume(&self, server: &str, volume_id: VolumeId) -> Result<()>;
}

/// [`VolumeAdmin`] over the volume servers' `/admin` HTTP API.
#[derive(Clone)]
pub struct VolumeServerClient {
    http: reqwest::Client,
}

impl VolumeServerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    async fn post<B: Serialize + ?Sized>(&self, server: &str, path: &str, body: &B) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(format!("{}{}", http_base(server), path))
            .json(body)
            .send()
            .await?;
        check_response(resp).await
    }

    async fn post_json<B, R>(&self, server: &str, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        Ok(self.post(server, path, body).await?.json().await?)
    }

    pub async fn allocate_volume(&self, server: &str, request: &AllocateVolumeRequest) -> Result<()> {
        self.post(server, "/admin/volume/allocate", request).await?;
        Ok(())
    }

    /// Download one shard and check it against the digest the source sent.
    pub async fn fetch_ec_shard(&self, source: &str, volume_id: VolumeId, shard_id: ShardId) -> Result<Bytes> {
        let resp = self
            .http
            .get(format!("{}/admin/ec/shard", http_base(source)))
            .query(&[
                ("volumeId", volume_id.to_string()),
                ("shardId", shard_id.to_string()),
            ])
            .send()
            .await?;
        let resp = check_response(resp).await?;
        let digest = resp
            .headers()
            .get(SHARD_DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Http(format!("missing {} header", SHARD_DIGEST_HEADER)))?;
        let data = resp.bytes().await?;
        verify_blake3(&data, &digest)?;
        Ok(data)
    }
}

#[async_trait]
impl VolumeAdmin for VolumeServerClient {
    async fn mark_readonly(&self, server: &str, volume_id: VolumeId) -> Result<()> {
        self.post(server, "/admin/volume/readonly", &VolumeRequest { volume_id })
            .await?;
        Ok(())
    }

    async fn mark_writable(&self, server: &str, volume_id: VolumeId) -> Result<()> {
        self.post(server, "/admin/volume/writable", &VolumeRequest { volume_id })
            .await?;
        Ok(())
    }

    async fn generate_ec_shards(&self, server: &str, volume_id: VolumeId, collection: &str) -> Result<()> {
        let request = GenerateEcShardsRequest {
            volume_id,
            collection: collection.to_string(),
        };
        self.post(server, "/admin/ec/generate", &request).await?;
        Ok(())
    }

    async fn copy_ec_shards(
        &self,
        target: &str,
        volume_id: VolumeId,
        collection: &str,
        shard_ids: &[ShardId],
        source: &str,
    ) -> Result<Vec<ShardId>> {
        let request = CopyEcShardsRequest {
            volume_id,
            collection: collection.to_string(),
            shard_ids: shard_ids.to_vec(),
            source: source.to_string(),
        };
        let resp: CopyEcShardsResponse = self.post_json(target, "/admin/ec/copy", &request).await?;
        Ok(resp.shard_ids)
    }

    async fn mount_ec_shards(
        &self,
        server: &str,
        volume_id: VolumeId,
        collection: &str,
        shard_ids: &[ShardId],
    ) -> Result<()> {
        let request = EcShardsRequest {
            volume_id,
            collection: collection.to_string(),
            shard_ids: shard_ids.to_vec(),
        };
        self.post(server, "/admin/ec/mount", &request).await?;
        Ok(())
    }

    async fn unmount_ec_shards(&self, server: &str, volume_id: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        let request = EcShardsRequest {
            volume_id,
            collection: String::new(),
            shard_ids: shard_ids.to_vec(),
        };
        self.post(server, "/admin/ec/unmount", &request).await?;
        Ok(())
    }

    async fn delete_ec_shards(
        &self,
        server: &str,
        volume_id: VolumeId,
        collection: &str,
        shard_ids: &[ShardId],
    ) -> Result<()> {
        let request = EcShardsRequest {
            volume_id,
            collection: collection.to_string(),
            shard_ids: shard_ids.to_vec(),
        };
        self.post(server, "/admin/ec/delete", &request).await?;
        Ok(())
    }

    async fn delete_volume(&self, server: &str, volume_id: VolumeId) -> Result<()> {
        self.post(server, "/admin/volume/delete", &VolumeRequest { volume_id })
            .await?;
        Ok(())
    }
}
