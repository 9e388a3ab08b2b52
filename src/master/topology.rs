//! Data-node registry fed by volume-server heartbeats

use crate::common::topology::{DataCenterInfo, DataNodeInfo, DiskInfo, RackInfo, TopologyInfo};
use crate::common::{ConcurrentMap, Location, LockedMap, NodeState, VolumeId};
use crate::operation::Heartbeat;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// One registered volume server.
#[derive(Debug)]
pub struct DataNode {
    pub url: String,
    inner: RwLock<DataNodeState>,
}

#[derive(Debug)]
struct DataNodeState {
    heartbeat: Heartbeat,
    last_seen: Instant,
}

impl DataNode {
    fn new(heartbeat: Heartbeat) -> Self {
        Self {
            url: heartbeat.url.clone(),
            inner: RwLock::new(DataNodeState {
                heartbeat,
                last_seen: Instant::now(),
            }),
        }
    }

    fn update(&self, heartbeat: Heartbeat) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.heartbeat = heartbeat;
        inner.last_seen = Instant::now();
    }

    pub fn state(&self, timeout: Duration) -> NodeState {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if inner.last_seen.elapsed() <= timeout {
            NodeState::Alive
        } else {
            NodeState::Dead
        }
    }

    fn heartbeat(&self) -> Heartbeat {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .heartbeat
            .clone()
    }
}

pub struct Topology {
    nodes: Box<dyn ConcurrentMap<String, Arc<DataNode>>>,
    volume_size_limit_mb: u64,
    node_timeout: Duration,
}

impl Topology {
    pub fn new(volume_size_limit_mb: u64, node_timeout: Duration) -> Self {
        Self {
            nodes: Box::new(LockedMap::new()),
            volume_size_limit_mb,
            node_timeout,
        }
    }

    pub fn volume_size_limit_mb(&self) -> u64 {
        self.volume_size_limit_mb
    }

    pub fn register_heartbeat(&self, heartbeat: Heartbeat) {
        if let Some(node) = self.nodes.get(&heartbeat.url) {
            node.update(heartbeat);
            return;
        }
        let url = heartbeat.url.clone();
        let node = Arc::new(DataNode::new(heartbeat.clone()));
        if self.nodes.set_if_absent(url.clone(), node) {
            tracing::info!(node = %url, dc = %heartbeat.data_center, rack = %heartbeat.rack, "data node joined");
        } else if let Some(node) = self.nodes.get(&url) {
            // another heartbeat registered it first
            node.update(heartbeat);
        }
    }

    fn alive_nodes(&self) -> Vec<Arc<DataNode>> {
        let mut nodes: Vec<Arc<DataNode>> = self
            .nodes
            .values()
            .into_iter()
            .filter(|n| n.state(self.node_timeout).is_healthy())
            .collect();
        nodes.sort_by(|a, b| a.url.cmp(&b.url));
        nodes
    }

    /// Live servers holding the volume or any of its ec shards, by url.
    pub fn lookup_volume(&self, volume_id: VolumeId) -> Vec<Location> {
        self.alive_nodes()
            .into_iter()
            .filter_map(|node| {
                let hb = node.heartbeat();
                let holds = hb.volumes.iter().any(|v| v.id == volume_id)
                    || hb.ec_shards.iter().any(|s| s.id == volume_id);
                holds.then(|| Location {
                    url: hb.url.clone(),
                    public_url: if hb.public_url.is_empty() {
                        hb.url.clone()
                    } else {
                        hb.public_url.clone()
                    },
                })
            })
            .collect()
    }

    /// Live nodes grouped by data center and rack.
    pub fn topology_info(&self) -> TopologyInfo {
        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<DataNodeInfo>>> = BTreeMap::new();
        for node in self.alive_nodes() {
            let hb = node.heartbeat();
            let volume_count = hb.volumes.len() as u64;
            let ec_slots = hb
                .ec_shards
                .iter()
                .map(|s| s.ec_index_bits.count())
                .sum::<usize>()
                .div_ceil(crate::common::ec::DATA_SHARDS_COUNT) as u64;
            let info = DataNodeInfo {
                id: hb.url.clone(),
                public_url: hb.public_url.clone(),
                disk_infos: vec![DiskInfo {
                    disk_type: String::new(),
                    max_volume_count: hb.max_volume_count,
                    volume_count,
                    free_volume_count: hb
                        .max_volume_count
                        .saturating_sub(volume_count + ec_slots),
                    volume_infos: hb.volumes,
                    ec_shard_infos: hb.ec_shards,
                }],
            };
            grouped
                .entry(hb.data_center)
                .or_default()
                .entry(hb.rack)
                .or_default()
                .push(info);
        }

        TopologyInfo {
            data_centers: grouped
                .into_iter()
                .map(|(dc, racks)| DataCenterInfo {
                    id: dc,
                    racks: racks
                        .into_iter()
                        .map(|(rack, data_nodes)| RackInfo { id: rack, data_nodes })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Forget nodes that stopped heartbeating. Returns their urls.
    pub fn prune_dead(&self) -> Vec<String> {
        let dead: Vec<String> = self
            .nodes
            .values()
            .into_iter()
            .filter(|n| !n.state(self.node_timeout).is_healthy())
            .map(|n| n.url.clone())
            .collect();
        for url in &dead {
            if self.nodes.remove(url).is_some() {
                tracing::warn!(node = %url, "data node expired");
            }
        }
        dead
    }

    pub fn node_count(&self) -> usize {
        self.alive_nodes().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ec::ShardBits;
    use crate::common::topology::{EcShardInfo, VolumeInfo};

    fn heartbeat(url: &str, rack: &str, vids: &[u32]) -> Heartbeat {
        Heartbeat {
            url: url.to_string(),
            data_center: "dc1".to_string(),
            rack: rack.to_string(),
            max_volume_count: 8,
            volumes: vids
                .iter()
                .map(|&id| VolumeInfo {
                    id: VolumeId(id),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_and_grouping() {
        let topo = Topology::new(30_000, Duration::from_secs(30));
        topo.register_heartbeat(heartbeat("b:8080", "r1", &[1, 2]));
        topo.register_heartbeat(heartbeat("a:8080", "r2", &[1]));
        let mut hb = heartbeat("c:8080", "r1", &[]);
        hb.ec_shards.push(EcShardInfo {
            id: VolumeId(1),
            collection: String::new(),
            ec_index_bits: ShardBits::from_ids(&[0, 1]),
        });
        topo.register_heartbeat(hb);

        let urls: Vec<String> = topo.lookup_volume(VolumeId(1)).into_iter().map(|l| l.url).collect();
        assert_eq!(urls, vec!["a:8080", "b:8080", "c:8080"]);
        assert_eq!(topo.lookup_volume(VolumeId(2)).len(), 1);
        assert!(topo.lookup_volume(VolumeId(9)).is_empty());

        let info = topo.topology_info();
        assert_eq!(info.data_centers.len(), 1);
        assert_eq!(info.data_centers[0].racks.len(), 2);
        assert_eq!(info.data_node_count(), 3);
    }

    #[test]
    fn test_heartbeat_updates_existing_node() {
        let topo = Topology::new(30_000, Duration::from_secs(30));
        topo.register_heartbeat(heartbeat("a:8080", "r1", &[1]));
        topo.register_heartbeat(heartbeat("a:8080", "r1", &[1, 5]));
        assert_eq!(topo.node_count(), 1);
        assert_eq!(topo.lookup_volume(VolumeId(5)).len(), 1);
    }

    #[test]
    fn test_dead_nodes_are_hidden_and_pruned() {
        let topo = Topology::new(30_000, Duration::from_millis(0));
        topo.register_heartbeat(heartbeat("a:8080", "r1", &[1]));
        std::thread::sleep(Duration::from_millis(5));
        assert!(topo.lookup_volume(VolumeId(1)).is_empty());
        assert_eq!(topo.prune_dead(), vec!["a:8080".to_string()]);
        assert_eq!(topo.node_count(), 0);
    }
}
