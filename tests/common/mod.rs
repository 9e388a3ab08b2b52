//! In-process fake cluster shared by the integration tests: a topology and
//! directory backed by shared state, a volume admin that records every RPC
//! and fails on demand, and an always-granting lock backend.

#![allow(dead_code)]

use async_trait::async_trait;
use needlefs::common::ec::{ShardBits, ShardId, TOTAL_SHARDS_COUNT};
use needlefs::common::topology::{
    DataCenterInfo, DataNodeInfo, DiskInfo, EcShardInfo, RackInfo, TopologyInfo, TopologyResponse,
    VolumeInfo,
};
use needlefs::common::{ClusterLock, Error, LockBackend, Location, Result, VolumeId};
use needlefs::operation::{LocationDirectory, TopologySource};
use needlefs::ops::EcCommandEnv;
use needlefs::volume::VolumeAdmin;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MB: u64 = 1024 * 1024;

#[derive(Default)]
struct ClusterState {
    /// node id -> volumes
    volumes: BTreeMap<String, Vec<VolumeInfo>>,
    shards: BTreeMap<(String, VolumeId), ShardBits>,
}

/// One recorded admin RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub server: String,
    pub volume_id: VolumeId,
    pub shard_ids: Vec<ShardId>,
}

pub struct FakeCluster {
    max_volume_count: u64,
    state: Mutex<ClusterState>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<BTreeSet<(&'static str, String)>>,
    pub volume_size_limit_mb: u64,
}

impl FakeCluster {
    /// `nodes` servers named `10.0.0.<i>:8080`, spread over two racks.
    pub fn new(nodes: usize, max_volume_count: u64) -> Arc<Self> {
        let mut state = ClusterState::default();
        for i in 0..nodes {
            state.volumes.insert(node_id(i), Vec::new());
        }
        Arc::new(Self {
            max_volume_count,
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(BTreeSet::new()),
            volume_size_limit_mb: 100,
        })
    }

    pub fn env(self: &Arc<Self>) -> EcCommandEnv {
        EcCommandEnv {
            topology: self.clone(),
            directory: self.clone(),
            admin: self.clone(),
        }
    }

    /// Place a full, long-quiet volume on the given nodes.
    pub fn add_sealed_volume(&self, volume_id: u32, collection: &str, on: &[usize]) {
        let mut state = self.state.lock().unwrap();
        for &i in on {
            state.volumes.entry(node_id(i)).or_default().push(VolumeInfo {
                id: VolumeId(volume_id),
                collection: collection.to_string(),
                size: 99 * MB,
                modified_at_second: 1,
                ..Default::default()
            });
        }
    }

    pub fn add_shards(&self, node: usize, volume_id: u32, shard_ids: &[ShardId]) {
        let mut state = self.state.lock().unwrap();
        let bits = state.shards.entry((node_id(node), VolumeId(volume_id))).or_default();
        *bits = bits.plus(ShardBits::from_ids(shard_ids));
    }

    pub fn fail_on(&self, op: &'static str, server: &str) {
        self.failures.lock().unwrap().insert((op, server.to_string()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn shard_bits(&self, node: &str, volume_id: u32) -> ShardBits {
        let state = self.state.lock().unwrap();
        state
            .shards
            .get(&(node.to_string(), VolumeId(volume_id)))
            .copied()
            .unwrap_or_default()
    }

    /// Union of the shards of a volume over every node.
    pub fn all_shards(&self, volume_id: u32) -> ShardBits {
        let state = self.state.lock().unwrap();
        state
            .shards
            .iter()
            .filter(|((_, vid), _)| *vid == VolumeId(volume_id))
            .fold(ShardBits::default(), |acc, (_, bits)| acc.plus(*bits))
    }

    /// Nodes holding at least one shard of the volume.
    pub fn shard_holders(&self, volume_id: u32) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .shards
            .iter()
            .filter(|((_, vid), bits)| *vid == VolumeId(volume_id) && bits.count() > 0)
            .map(|((node, _), _)| node.clone())
            .collect()
    }

    pub fn volume_holders(&self, volume_id: u32) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .volumes
            .iter()
            .filter(|(_, vols)| vols.iter().any(|v| v.id == VolumeId(volume_id)))
            .map(|(node, _)| node.clone())
            .collect()
    }

    fn record(&self, op: &'static str, server: &str, volume_id: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        self.calls.lock().unwrap().push(Call {
            op,
            server: server.to_string(),
            volume_id,
            shard_ids: shard_ids.to_vec(),
        });
        if self.failures.lock().unwrap().contains(&(op, server.to_string())) {
            return Err(Error::Http(format!("{} on {} refused", op, server)));
        }
        Ok(())
    }

    fn with_shards(&self, server: &str, volume_id: VolumeId, f: impl FnOnce(ShardBits) -> ShardBits) {
        let mut state = self.state.lock().unwrap();
        let bits = state.shards.entry((server.to_string(), volume_id)).or_default();
        *bits = f(*bits);
    }
}

pub fn node_id(i: usize) -> String {
    format!("10.0.0.{}:8080", i + 1)
}

#[async_trait]
impl TopologySource for FakeCluster {
    async fn topology_info(&self) -> Result<TopologyResponse> {
        let state = self.state.lock().unwrap();
        let mut racks: BTreeMap<String, Vec<DataNodeInfo>> = BTreeMap::new();
        for (i, (node, volumes)) in state.volumes.iter().enumerate() {
            let ec_shard_infos: Vec<EcShardInfo> = state
                .shards
                .iter()
                .filter(|((n, _), bits)| n == node && bits.count() > 0)
                .map(|((_, vid), bits)| EcShardInfo {
                    id: *vid,
                    collection: String::new(),
                    ec_index_bits: *bits,
                })
                .collect();
            let volume_count = volumes.len() as u64;
            racks.entry(format!("rack{}", i % 2)).or_default().push(DataNodeInfo {
                id: node.clone(),
                public_url: node.clone(),
                disk_infos: vec![DiskInfo {
                    max_volume_count: self.max_volume_count,
                    volume_count,
                    free_volume_count: self.max_volume_count.saturating_sub(volume_count),
                    volume_infos: volumes.clone(),
                    ec_shard_infos,
                    ..Default::default()
                }],
            });
        }
        Ok(TopologyResponse {
            topology: TopologyInfo {
                data_centers: vec![DataCenterInfo {
                    id: "dc1".into(),
                    racks: racks
                        .into_iter()
                        .map(|(id, data_nodes)| RackInfo { id, data_nodes })
                        .collect(),
                }],
            },
            volume_size_limit_mb: self.volume_size_limit_mb,
        })
    }
}

#[async_trait]
impl LocationDirectory for FakeCluster {
    async fn lookup_volume(&self, volume_id: VolumeId) -> Result<Vec<Location>> {
        let holders = self.volume_holders(volume_id.0);
        if holders.is_empty() {
            return Err(Error::NotFound(format!("volume {} not found", volume_id)));
        }
        Ok(holders.into_iter().map(Location::new).collect())
    }
}

#[async_trait]
impl VolumeAdmin for FakeCluster {
    async fn mark_readonly(&self, server: &str, volume_id: VolumeId) -> Result<()> {
        self.record("readonly", server, volume_id, &[])
    }

    async fn mark_writable(&self, server: &str, volume_id: VolumeId) -> Result<()> {
        self.record("writable", server, volume_id, &[])
    }

    async fn generate_ec_shards(&self, server: &str, volume_id: VolumeId, _collection: &str) -> Result<()> {
        self.record("generate", server, volume_id, &[])?;
        let all: Vec<ShardId> = (0..TOTAL_SHARDS_COUNT as ShardId).collect();
        self.with_shards(server, volume_id, |bits| bits.plus(ShardBits::from_ids(&all)));
        Ok(())
    }

    async fn copy_ec_shards(
        &self,
        target: &str,
        volume_id: VolumeId,
        _collection: &str,
        shard_ids: &[ShardId],
        _source: &str,
    ) -> Result<Vec<ShardId>> {
        // yield so parallel copies interleave
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.record("copy", target, volume_id, shard_ids)?;
        self.with_shards(target, volume_id, |bits| bits.plus(ShardBits::from_ids(shard_ids)));
        Ok(shard_ids.to_vec())
    }

    async fn mount_ec_shards(
        &self,
        server: &str,
        volume_id: VolumeId,
        _collection: &str,
        shard_ids: &[ShardId],
    ) -> Result<()> {
        self.record("mount", server, volume_id, shard_ids)
    }

    async fn unmount_ec_shards(&self, server: &str, volume_id: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        self.record("unmount", server, volume_id, shard_ids)
    }

    async fn delete_ec_shards(
        &self,
        server: &str,
        volume_id: VolumeId,
        _collection: &str,
        shard_ids: &[ShardId],
    ) -> Result<()> {
        self.record("delete_shards", server, volume_id, shard_ids)?;
        self.with_shards(server, volume_id, |bits| {
            shard_ids.iter().fold(bits, |acc, &id| acc.remove(id))
        });
        Ok(())
    }

    async fn delete_volume(&self, server: &str, volume_id: VolumeId) -> Result<()> {
        self.record("delete_volume", server, volume_id, &[])?;
        let mut state = self.state.lock().unwrap();
        if let Some(volumes) = state.volumes.get_mut(server) {
            volumes.retain(|v| v.id != volume_id);
        }
        Ok(())
    }
}

/// Grants every request; `revoke` makes renewals fail so the holder loses
/// the lock.
#[derive(Default)]
pub struct TestLockBackend {
    revoked: Mutex<bool>,
}

impl TestLockBackend {
    pub fn revoke(&self) {
        *self.revoked.lock().unwrap() = true;
    }
}

#[async_trait]
impl LockBackend for TestLockBackend {
    async fn acquire(&self, _owner: &str) -> Result<Duration> {
        if *self.revoked.lock().unwrap() {
            return Err(Error::LockHeld("another-shell".into()));
        }
        Ok(Duration::from_millis(60))
    }

    async fn release(&self, _owner: &str) -> Result<()> {
        Ok(())
    }
}

pub async fn lock() -> (ClusterLock, Arc<TestLockBackend>) {
    let backend = Arc::new(TestLockBackend::default());
    let lock = ClusterLock::acquire(backend.clone(), "test-shell").await.unwrap();
    (lock, backend)
}
