//! Cluster topology snapshot exchanged between the master, volume servers
//! and the operator commands.

use crate::common::ec::ShardBits;
use crate::common::types::VolumeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: VolumeId,
    pub size: u64,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub delete_count: u64,
    #[serde(default)]
    pub read_only: bool,
    /// Replica placement as its `xyz` byte value.
    #[serde(default)]
    pub replica_placement: u8,
    #[serde(default)]
    pub ttl: String,
    #[serde(default)]
    pub modified_at_second: i64,
    #[serde(default)]
    pub remote_storage_name: String,
    #[serde(default)]
    pub remote_storage_key: String,
}

impl VolumeInfo {
    /// Tiered to remote storage; never a candidate for local encoding.
    pub fn is_remote(&self) -> bool {
        !self.remote_storage_name.is_empty() && !self.remote_storage_key.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EcShardInfo {
    pub id: VolumeId,
    #[serde(default)]
    pub collection: String,
    pub ec_index_bits: ShardBits,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(default)]
    pub disk_type: String,
    pub max_volume_count: u64,
    pub volume_count: u64,
    pub free_volume_count: u64,
    #[serde(default)]
    pub volume_infos: Vec<VolumeInfo>,
    #[serde(default)]
    pub ec_shard_infos: Vec<EcShardInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataNodeInfo {
    /// `ip:port`, also the server address used for RPCs.
    pub id: String,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub disk_infos: Vec<DiskInfo>,
}

impl DataNodeInfo {
    pub fn has_volume(&self, vid: VolumeId) -> bool {
        self.disk_infos
            .iter()
            .any(|d| d.volume_infos.iter().any(|v| v.id == vid))
    }

    pub fn ec_shard_bits(&self, vid: VolumeId) -> ShardBits {
        self.disk_infos
            .iter()
            .flat_map(|d| d.ec_shard_infos.iter())
            .filter(|s| s.id == vid)
            .fold(ShardBits::default(), |acc, s| acc.plus(s.ec_index_bits))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RackInfo {
    pub id: String,
    #[serde(default)]
    pub data_nodes: Vec<DataNodeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataCenterInfo {
    pub id: String,
    #[serde(default)]
    pub racks: Vec<RackInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyInfo {
    #[serde(default)]
    pub data_centers: Vec<DataCenterInfo>,
}

impl TopologyInfo {
    /// Every data node with its data center and rack ids.
    pub fn data_nodes(&self) -> impl Iterator<Item = (&str, &str, &DataNodeInfo)> {
        self.data_centers.iter().flat_map(|dc| {
            dc.racks.iter().flat_map(move |rack| {
                rack.data_nodes
                    .iter()
                    .map(move |dn| (dc.id.as_str(), rack.id.as_str(), dn))
            })
        })
    }

    pub fn data_node_count(&self) -> usize {
        self.data_nodes().count()
    }

    /// Distinct collection names of plain and erasure-coded volumes.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for (_, _, dn) in self.data_nodes() {
            for disk in &dn.disk_infos {
                names.extend(disk.volume_infos.iter().map(|v| v.collection.clone()));
                names.extend(disk.ec_shard_infos.iter().map(|s| s.collection.clone()));
            }
        }
        names.into_iter().collect()
    }
}

/// What the master hands out for `GET /cluster/topology`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyResponse {
    pub topology: TopologyInfo,
    pub volume_size_limit_mb: u64,
}
