//! Shared pieces of the erasure-coding commands: the per-invocation view of
//! volume servers, the shard allocator and the copy/unwind workers.

use crate::common::ec::{ShardBits, ShardId, DATA_SHARDS_COUNT, TOTAL_SHARDS_COUNT};
use crate::common::topology::TopologyInfo;
use crate::common::{Error, Result, VolumeId};
use crate::volume::VolumeAdmin;
use futures_util::future::join_all;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A volume server as the placement commands see it. Built fresh from the
/// topology on every invocation and never shared between invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct EcNode {
    /// `ip:port`
    pub id: String,
    pub data_center: String,
    pub rack: String,
    pub free_ec_slot: usize,
    pub ec_shards: BTreeMap<VolumeId, ShardBits>,
}

impl EcNode {
    pub fn add_ec_volume_shards(&mut self, volume_id: VolumeId, shard_ids: &[ShardId]) {
        let bits = self.ec_shards.entry(volume_id).or_default();
        *bits = bits.plus(ShardBits::from_ids(shard_ids));
    }
}

/// Every data node with its free shard slots, most free first, plus the
/// total number of free slots. `data_center` narrows the set when non-empty.
pub fn collect_ec_nodes(topology: &TopologyInfo, data_center: &str) -> (Vec<EcNode>, usize) {
    let mut nodes: Vec<EcNode> = topology
        .data_nodes()
        .filter(|(dc, _, _)| data_center.is_empty() || *dc == data_center)
        .map(|(dc, rack, dn)| {
            let free_ec_slot = dn
                .disk_infos
                .iter()
                .map(|disk| {
                    let slots = disk.max_volume_count.saturating_sub(disk.volume_count) as usize
                        * DATA_SHARDS_COUNT;
                    let used: usize = disk
                        .ec_shard_infos
                        .iter()
                        .map(|s| s.ec_index_bits.count())
                        .sum();
                    slots.saturating_sub(used)
                })
                .sum();
            let mut ec_shards = BTreeMap::new();
            for shard in dn.disk_infos.iter().flat_map(|d| d.ec_shard_infos.iter()) {
                let bits: &mut ShardBits = ec_shards.entry(shard.id).or_default();
                *bits = bits.plus(shard.ec_index_bits);
            }
            EcNode {
                id: dn.id.clone(),
                data_center: dc.to_string(),
                rack: rack.to_string(),
                free_ec_slot,
                ec_shards,
            }
        })
        .collect();

    nodes.sort_by(|a, b| {
        b.free_ec_slot
            .cmp(&a.free_ec_slot)
            .then_with(|| a.id.cmp(&b.id))
    });
    let total_free = nodes.iter().map(|n| n.free_ec_slot).sum();
    (nodes, total_free)
}

/// Round-robin every shard id over `servers`, starting at a random server.
/// See [`balanced_ec_distribution_from`].
pub fn balanced_ec_distribution(volume_id: VolumeId, servers: &mut [EcNode]) -> Result<Vec<Vec<ShardId>>> {
    let start = if servers.is_empty() {
        0
    } else {
        rand::thread_rng().gen_range(0..servers.len())
    };
    balanced_ec_distribution_from(volume_id, servers, start)
}

/// Walk the servers from `start`, giving the next shard id to the current
/// server when it still has a free slot, and advancing after every step.
/// Slots are consumed as they are handed out. The result is indexed like
/// `servers`.
pub fn balanced_ec_distribution_from(
    volume_id: VolumeId,
    servers: &mut [EcNode],
    start: usize,
) -> Result<Vec<Vec<ShardId>>> {
    let total_free: usize = servers.iter().map(|s| s.free_ec_slot).sum();
    if total_free < TOTAL_SHARDS_COUNT {
        return Err(Error::NotEnoughEcSlots {
            volume_id,
            free: total_free,
            required: TOTAL_SHARDS_COUNT,
        });
    }

    let mut allocated = vec![Vec::new(); servers.len()];
    let mut index = start % servers.len();
    let mut shard_id: usize = 0;
    while shard_id < TOTAL_SHARDS_COUNT {
        let server = &mut servers[index];
        if server.free_ec_slot > 0 {
            allocated[index].push(shard_id as ShardId);
            server.free_ec_slot -= 1;
            shard_id += 1;
        }
        index = (index + 1) % servers.len();
    }
    Ok(allocated)
}

/// Copy (unless the target is the source) and mount one target's shards.
/// Returns the ids that were actually transferred.
pub async fn one_server_copy_and_mount_ec_shards_from_source(
    admin: &dyn VolumeAdmin,
    target: &str,
    shard_ids: &[ShardId],
    volume_id: VolumeId,
    collection: &str,
    source: &str,
) -> Result<Vec<ShardId>> {
    let copy_error = |reason: String| Error::ShardCopy {
        volume_id,
        server: target.to_string(),
        shard_ids: shard_ids.to_vec(),
        reason,
    };

    let mut copied = Vec::new();
    if target != source {
        tracing::info!(volume = %volume_id, shards = ?shard_ids, "copy {} => {}", source, target);
        admin
            .copy_ec_shards(target, volume_id, collection, shard_ids, source)
            .await
            .map_err(|e| copy_error(format!("copy from {}: {}", source, e)))?;
        copied = shard_ids.to_vec();
    }

    tracing::info!(volume = %volume_id, shards = ?shard_ids, "mount on {}", target);
    admin
        .mount_ec_shards(target, volume_id, collection, shard_ids)
        .await
        .map_err(|e| copy_error(format!("mount: {}", e)))?;

    Ok(copied)
}

/// What the shards on the copy source are to the rest of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    /// Freshly generated from a live volume that still exists. A failed
    /// placement may remove them everywhere.
    Generated,
    /// The only complete copy of the shards. A failed placement must leave
    /// them in place and mounted.
    Authoritative,
}

/// Best-effort removal of one target's allocation. The source's copy is
/// removed as well unless it is authoritative. Failures are only logged.
async fn cleanup_allocation(
    admin: &dyn VolumeAdmin,
    target: &str,
    shard_ids: &[ShardId],
    volume_id: VolumeId,
    collection: &str,
    source: &str,
    role: SourceRole,
) {
    if role == SourceRole::Authoritative && target == source {
        return;
    }
    if let Err(e) = admin.unmount_ec_shards(target, volume_id, shard_ids).await {
        tracing::warn!(volume = %volume_id, shards = ?shard_ids, "unmount on {}: {}", target, e);
    }
    if let Err(e) = admin.delete_ec_shards(target, volume_id, collection, shard_ids).await {
        tracing::warn!(volume = %volume_id, shards = ?shard_ids, "delete on {}: {}", target, e);
    }
    if role == SourceRole::Generated && target != source {
        if let Err(e) = admin.delete_ec_shards(source, volume_id, collection, shard_ids).await {
            tracing::warn!(volume = %volume_id, shards = ?shard_ids, "delete on source {}: {}", source, e);
        }
    }
}

/// Have every target with a non-empty allocation pull its shards from
/// `source` and mount them. On any failure the allocations are unwound as
/// [`cleanup_allocation`] allows for `role`, and nothing is reported as
/// copied. On success the targets' [`EcNode`]s record their new shards.
#[allow(clippy::too_many_arguments)]
pub async fn parallel_copy_ec_shards_from_source(
    admin: Arc<dyn VolumeAdmin>,
    targets: &mut [EcNode],
    allocated: &[Vec<ShardId>],
    volume_id: VolumeId,
    collection: &str,
    source: &str,
    role: SourceRole,
    parallelize: bool,
) -> Result<Vec<ShardId>> {
    let work: Vec<(usize, &[ShardId])> = allocated
        .iter()
        .enumerate()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(i, ids)| (i, ids.as_slice()))
        .collect();

    let results: Vec<(usize, Result<Vec<ShardId>>)> = if parallelize {
        let ids_of = |i: usize| targets[i].id.clone();
        join_all(work.iter().map(|&(i, ids)| {
            let admin = admin.clone();
            let target = ids_of(i);
            async move {
                let result = one_server_copy_and_mount_ec_shards_from_source(
                    admin.as_ref(),
                    &target,
                    ids,
                    volume_id,
                    collection,
                    source,
                )
                .await;
                (i, result)
            }
        }))
        .await
    } else {
        let mut results = Vec::with_capacity(work.len());
        for &(i, ids) in &work {
            let result = one_server_copy_and_mount_ec_shards_from_source(
                admin.as_ref(),
                &targets[i].id,
                ids,
                volume_id,
                collection,
                source,
            )
            .await;
            let failed = result.is_err();
            results.push((i, result));
            if failed {
                break;
            }
        }
        results
    };

    let mut copied = Vec::new();
    let mut succeeded = Vec::new();
    let mut first_error = None;
    for (i, result) in results {
        match result {
            Ok(ids) => {
                copied.extend(ids);
                succeeded.push(i);
            }
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(e) => tracing::error!(volume = %volume_id, "{}", e),
        }
    }

    if let Some(err) = first_error {
        tracing::error!(volume = %volume_id, "{}; unwinding shard placement", err);
        join_all(work.iter().map(|&(i, ids)| {
            let target = targets[i].id.clone();
            let admin = admin.clone();
            async move {
                cleanup_allocation(admin.as_ref(), &target, ids, volume_id, collection, source, role).await
            }
        }))
        .await;
        return Err(err);
    }

    for i in succeeded {
        targets[i].add_ec_volume_shards(volume_id, &allocated[i]);
    }
    copied.sort_unstable();
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::topology::{DataCenterInfo, DataNodeInfo, DiskInfo, EcShardInfo, RackInfo};
    use std::collections::HashSet;

    fn node(id: &str, free: usize) -> EcNode {
        EcNode {
            id: id.to_string(),
            data_center: "dc1".into(),
            rack: "r1".into(),
            free_ec_slot: free,
            ec_shards: BTreeMap::new(),
        }
    }

    fn assert_complete_assignment(allocated: &[Vec<ShardId>]) {
        let all: Vec<ShardId> = allocated.iter().flatten().copied().collect();
        assert_eq!(all.len(), TOTAL_SHARDS_COUNT);
        let unique: HashSet<ShardId> = all.into_iter().collect();
        assert_eq!(unique.len(), TOTAL_SHARDS_COUNT);
    }

    #[test]
    fn test_distribution_respects_free_slots() {
        let frees: Vec<Vec<usize>> = vec![
            vec![14],
            vec![1, 1, 12],
            vec![3, 0, 5, 0, 6],
            vec![2; 7],
            vec![1; 14],
            vec![100, 0, 1],
        ];
        for free in frees {
            for start in 0..free.len() {
                let mut servers: Vec<EcNode> = free
                    .iter()
                    .enumerate()
                    .map(|(i, &f)| node(&format!("s{}", i), f))
                    .collect();
                let allocated = balanced_ec_distribution_from(VolumeId(1), &mut servers, start).unwrap();
                assert_complete_assignment(&allocated);
                for (i, ids) in allocated.iter().enumerate() {
                    assert!(ids.len() <= free[i], "server {} over-assigned", i);
                    assert_eq!(servers[i].free_ec_slot, free[i] - ids.len());
                }
            }
        }
    }

    #[test]
    fn test_distribution_round_robin_from_start() {
        let mut servers: Vec<EcNode> = (0..4).map(|i| node(&format!("s{}", i), 10)).collect();
        let allocated = balanced_ec_distribution_from(VolumeId(1), &mut servers, 2).unwrap();
        assert_eq!(allocated[2], vec![0, 4, 8, 12]);
        assert_eq!(allocated[3], vec![1, 5, 9, 13]);
        assert_eq!(allocated[0], vec![2, 6, 10]);
        assert_eq!(allocated[1], vec![3, 7, 11]);
    }

    #[test]
    fn test_distribution_needs_enough_slots() {
        let mut servers = vec![node("a", 6), node("b", 7)];
        assert!(matches!(
            balanced_ec_distribution(VolumeId(9), &mut servers),
            Err(Error::NotEnoughEcSlots { free: 13, .. })
        ));
        let mut servers = vec![node("a", 7), node("b", 7)];
        assert_complete_assignment(&balanced_ec_distribution(VolumeId(9), &mut servers).unwrap());
        assert!(servers.iter().all(|s| s.free_ec_slot == 0));
    }

    #[test]
    fn test_collect_ec_nodes_sorted_by_free_slots() {
        let dn = |id: &str, max: u64, count: u64, shards: &[ShardId]| DataNodeInfo {
            id: id.into(),
            public_url: id.into(),
            disk_infos: vec![DiskInfo {
                max_volume_count: max,
                volume_count: count,
                free_volume_count: max - count,
                ec_shard_infos: if shards.is_empty() {
                    vec![]
                } else {
                    vec![EcShardInfo {
                        id: VolumeId(7),
                        collection: String::new(),
                        ec_index_bits: ShardBits::from_ids(shards),
                    }]
                },
                ..Default::default()
            }],
        };
        let topology = TopologyInfo {
            data_centers: vec![
                DataCenterInfo {
                    id: "dc1".into(),
                    racks: vec![RackInfo {
                        id: "r1".into(),
                        data_nodes: vec![dn("a", 2, 1, &[0, 1, 2]), dn("b", 3, 1, &[])],
                    }],
                },
                DataCenterInfo {
                    id: "dc2".into(),
                    racks: vec![RackInfo {
                        id: "r9".into(),
                        data_nodes: vec![dn("c", 1, 1, &[])],
                    }],
                },
            ],
        };

        let (nodes, total) = collect_ec_nodes(&topology, "");
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(nodes[0].free_ec_slot, 20);
        assert_eq!(nodes[1].free_ec_slot, 7);
        assert_eq!(nodes[1].ec_shards[&VolumeId(7)].count(), 3);
        assert_eq!(total, 27);

        let (nodes, total) = collect_ec_nodes(&topology, "dc2");
        assert_eq!(nodes.len(), 1);
        assert_eq!(total, 0);
    }
}
