//! `ec.encode`: turn sealed volumes into erasure-coded shards spread over
//! the cluster
//!
//! Per volume: freeze every replica, generate the shards on the first
//! replica, spread them with the round-robin allocator, and only after every
//! target holds its shards drop the source copies and the original volume.
//! A volume that fails before its shards are placed is unwound and left
//! writable. One that fails afterwards stays read-only. The others carry on.

use crate::common::config::EcConfig;
use crate::common::ec::{ShardId, PARITY_SHARDS_COUNT, TOTAL_SHARDS_COUNT};
use crate::common::topology::TopologyInfo;
use crate::common::{timestamp_now, ClusterLock, Error, Location, ReplicaPlacement, Result, VolumeId};
use crate::operation::distributed_operation;
use crate::ops::ec_balance::ec_balance;
use crate::ops::ec_common::{
    balanced_ec_distribution, collect_ec_nodes, parallel_copy_ec_shards_from_source, SourceRole,
};
use crate::ops::EcCommandEnv;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EcEncodeOptions {
    pub collection: String,
    /// Encode exactly this volume instead of scanning the collection.
    pub volume_id: Option<VolumeId>,
    /// Minimum fullness in percent of the volume size limit.
    pub full_percent: f64,
    pub quiet_for: Duration,
    pub parallelize: bool,
    /// Skip the minimum node count check.
    pub force: bool,
    pub min_data_nodes: usize,
    pub shard_replica_placement: Option<ReplicaPlacement>,
    /// Balance already encoded volumes of the same collections afterwards.
    pub rebalance: bool,
}

impl EcEncodeOptions {
    pub fn from_config(config: &EcConfig) -> Result<Self> {
        Ok(Self {
            collection: String::new(),
            volume_id: None,
            full_percent: config.full_percent,
            quiet_for: config.quiet_period()?,
            parallelize: config.parallelize,
            force: false,
            min_data_nodes: config.min_data_nodes,
            shard_replica_placement: None,
            rebalance: false,
        })
    }
}

impl Default for EcEncodeOptions {
    fn default() -> Self {
        Self {
            collection: String::new(),
            volume_id: None,
            full_percent: 95.0,
            quiet_for: Duration::from_secs(3600),
            parallelize: true,
            force: false,
            min_data_nodes: PARITY_SHARDS_COUNT,
            shard_replica_placement: None,
            rebalance: false,
        }
    }
}

/// What one invocation did.
#[derive(Debug, Default)]
pub struct EcEncodeReport {
    /// Set when the whole invocation was skipped before touching any volume.
    pub skipped: Option<String>,
    pub candidates: Vec<VolumeId>,
    /// Shards generated and spread, source cleaned up.
    pub encoded: Vec<VolumeId>,
    pub failures: Vec<(VolumeId, Error)>,
    /// Why the follow-up balance could not run at all.
    pub rebalance_error: Option<Error>,
}

impl EcEncodeReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.rebalance_error.is_none()
    }

    /// One `volume <id>: <error>` line per failed volume, then the balance
    /// error if any.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|(vid, e)| format!("volume {}: {}", vid, e))
            .chain(self.rebalance_error.iter().map(|e| format!("rebalance: {}", e)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Volumes of `collection` that are quiet and full enough to encode, sorted.
///
/// A volume is a candidate when it has not been written for longer than
/// `quiet_for`, is strictly larger than `full_percent` of the size limit,
/// is not tiered to remote storage, and every disk holding it keeps at least
/// two free volume slots.
pub fn collect_volume_ids_for_ec_encode(
    topology: &TopologyInfo,
    volume_size_limit_mb: u64,
    collection: &str,
    full_percent: f64,
    quiet_for: Duration,
    now_unix_seconds: i64,
) -> Vec<VolumeId> {
    let quiet_seconds = quiet_for.as_secs() as i64;
    let threshold = full_percent / 100.0 * volume_size_limit_mb as f64 * 1024.0 * 1024.0;
    tracing::info!(
        "collect volumes quiet for: {} seconds and {:.1}% full",
        quiet_seconds,
        full_percent
    );

    let mut verdicts: BTreeMap<VolumeId, bool> = BTreeMap::new();
    for (_, _, dn) in topology.data_nodes() {
        for disk in &dn.disk_infos {
            for v in &disk.volume_infos {
                if v.is_remote() || v.collection != collection {
                    continue;
                }
                if v.modified_at_second + quiet_seconds >= now_unix_seconds {
                    continue;
                }
                if v.size as f64 <= threshold {
                    continue;
                }
                let has_room = disk.free_volume_count >= 2;
                if !has_room {
                    tracing::warn!("skip {} {} on {}, no free disk", v.collection, v.id, dn.id);
                }
                verdicts
                    .entry(v.id)
                    .and_modify(|good| *good &= has_room)
                    .or_insert(has_room);
            }
        }
    }

    verdicts
        .into_iter()
        .filter_map(|(vid, good)| good.then_some(vid))
        .collect()
}

/// Collection of a volume as reported by any server holding it.
fn collection_of(topology: &TopologyInfo, volume_id: VolumeId) -> Option<String> {
    topology
        .data_nodes()
        .flat_map(|(_, _, dn)| dn.disk_infos.iter())
        .flat_map(|d| d.volume_infos.iter())
        .find(|v| v.id == volume_id)
        .map(|v| v.collection.clone())
}

pub async fn ec_encode(env: &EcCommandEnv, lock: &ClusterLock, opts: &EcEncodeOptions) -> Result<EcEncodeReport> {
    lock.confirm_is_locked()?;

    let mut report = EcEncodeReport::default();
    let topology = env.topology.topology_info().await?;

    if !opts.force {
        let nodes = topology.topology.data_node_count();
        if nodes < opts.min_data_nodes {
            let err = Error::InsufficientNodes {
                nodes,
                required: opts.min_data_nodes,
            };
            tracing::warn!("{}", err);
            report.skipped = Some(err.to_string());
            return Ok(report);
        }
    }

    if let Some(rp) = opts.shard_replica_placement {
        tracing::info!(placement = %rp, "using shard replica placement");
    }

    let (volume_ids, collection) = match opts.volume_id {
        Some(vid) => {
            let collection = collection_of(&topology.topology, vid).unwrap_or_else(|| opts.collection.clone());
            (vec![vid], collection)
        }
        None => (
            collect_volume_ids_for_ec_encode(
                &topology.topology,
                topology.volume_size_limit_mb,
                &opts.collection,
                opts.full_percent,
                opts.quiet_for,
                timestamp_now() as i64,
            ),
            opts.collection.clone(),
        ),
    };
    report.candidates = volume_ids.clone();
    if volume_ids.is_empty() {
        tracing::info!(collection = %collection, "no volumes to encode");
    }

    for vid in volume_ids {
        match encode_one(env, lock, &collection, vid, opts.parallelize).await {
            Ok(()) => report.encoded.push(vid),
            Err(e) => {
                tracing::error!(volume = %vid, "ec encode: {}", e);
                report.failures.push((vid, e));
            }
        }
    }

    if opts.rebalance {
        let collections = if collection.is_empty() { Vec::new() } else { vec![collection] };
        match ec_balance(env, lock, &collections, opts.parallelize, true).await {
            Ok(balance) => report.failures.extend(balance.failures),
            Err(e) => {
                tracing::error!("ec balance after encode: {}", e);
                report.rebalance_error = Some(e);
            }
        }
    }

    Ok(report)
}

async fn encode_one(
    env: &EcCommandEnv,
    lock: &ClusterLock,
    collection: &str,
    volume_id: VolumeId,
    parallelize: bool,
) -> Result<()> {
    let locations = do_ec_encode(env, lock, collection, volume_id).await?;
    let replicas: Vec<String> = locations.iter().map(|l| l.url.clone()).collect();
    let source = &replicas[0];

    let placed = place_ec_shards(
        env,
        lock,
        volume_id,
        collection,
        source,
        SourceRole::Generated,
        parallelize,
    )
    .await;
    let copied = match placed {
        Ok(copied) => copied,
        Err(e) => {
            restore_writable(env, volume_id, &locations).await;
            return Err(e);
        }
    };

    // past this point the volume stays read-only
    finish_ec_placement(env, volume_id, collection, source, &copied, &replicas)
        .await
        .map_err(|e| {
            tracing::warn!(volume = %volume_id, "shards placed, volume left read-only");
            e
        })
}

/// Freeze every replica and generate the shards on the first one. Returns
/// the replica locations. Any failure leaves the replicas writable again.
pub async fn do_ec_encode(
    env: &EcCommandEnv,
    lock: &ClusterLock,
    collection: &str,
    volume_id: VolumeId,
) -> Result<Vec<Location>> {
    lock.confirm_is_locked()?;

    let locations = env
        .directory
        .lookup_volume(volume_id)
        .await
        .map_err(|e| Error::Lookup {
            volume_id,
            reason: e.to_string(),
        })?;
    let Some(source) = locations.first().map(|l| l.url.clone()) else {
        return Err(Error::Lookup {
            volume_id,
            reason: "volume has no locations".into(),
        });
    };

    let admin = env.admin.clone();
    let frozen = distributed_operation(&locations, move |location| {
        let admin = admin.clone();
        async move { admin.mark_readonly(&location.url, volume_id).await }
    })
    .await;
    if let Err(e) = frozen {
        restore_writable(env, volume_id, &locations).await;
        return Err(Error::EcEncode {
            volume_id,
            server: source,
            reason: format!("mark volume read-only:\n{}", e),
        });
    }

    tracing::info!(volume = %volume_id, collection, "generate ec shards on {}", source);
    if let Err(e) = env.admin.generate_ec_shards(&source, volume_id, collection).await {
        restore_writable(env, volume_id, &locations).await;
        return Err(Error::EcEncode {
            volume_id,
            server: source,
            reason: format!("generate ec shards: {}", e),
        });
    }

    Ok(locations)
}

/// Spread the complete shard set held by `source` over the cluster and
/// drop the moved shards from it. The source keeps its shards if placement
/// fails.
pub async fn spread_ec_shards(
    env: &EcCommandEnv,
    lock: &ClusterLock,
    volume_id: VolumeId,
    collection: &str,
    source: &str,
    parallelize: bool,
) -> Result<()> {
    let copied = place_ec_shards(
        env,
        lock,
        volume_id,
        collection,
        source,
        SourceRole::Authoritative,
        parallelize,
    )
    .await?;
    finish_ec_placement(env, volume_id, collection, source, &copied, &[]).await
}

/// Allocate the 14 shards over the servers with the most free slots and
/// have every target copy and mount its share. Returns the ids that left
/// `source`.
async fn place_ec_shards(
    env: &EcCommandEnv,
    lock: &ClusterLock,
    volume_id: VolumeId,
    collection: &str,
    source: &str,
    role: SourceRole,
    parallelize: bool,
) -> Result<Vec<ShardId>> {
    lock.confirm_is_locked()?;

    let topology = env.topology.topology_info().await?;
    let (mut nodes, total_free) = collect_ec_nodes(&topology.topology, "");
    if total_free < TOTAL_SHARDS_COUNT {
        return Err(Error::NotEnoughEcSlots {
            volume_id,
            free: total_free,
            required: TOTAL_SHARDS_COUNT,
        });
    }
    nodes.truncate(TOTAL_SHARDS_COUNT);

    let allocated = balanced_ec_distribution(volume_id, &mut nodes)?;
    let copied = parallel_copy_ec_shards_from_source(
        env.admin.clone(),
        &mut nodes,
        &allocated,
        volume_id,
        collection,
        source,
        role,
        parallelize,
    )
    .await?;

    tracing::info!(
        volume = %volume_id,
        "ec shards spread over {} servers",
        allocated.iter().filter(|a| !a.is_empty()).count()
    );
    Ok(copied)
}

/// Unmount and delete the `copied` shards on `source`, then delete the
/// original volume from every server in `originals`.
async fn finish_ec_placement(
    env: &EcCommandEnv,
    volume_id: VolumeId,
    collection: &str,
    source: &str,
    copied: &[ShardId],
    originals: &[String],
) -> Result<()> {
    if !copied.is_empty() {
        env.admin
            .unmount_ec_shards(source, volume_id, copied)
            .await
            .map_err(|e| Error::ShardCopy {
                volume_id,
                server: source.to_string(),
                shard_ids: copied.to_vec(),
                reason: format!("unmount copied shards on source: {}", e),
            })?;
        env.admin
            .delete_ec_shards(source, volume_id, collection, copied)
            .await
            .map_err(|e| Error::ShardCopy {
                volume_id,
                server: source.to_string(),
                shard_ids: copied.to_vec(),
                reason: format!("delete copied shards on source: {}", e),
            })?;
    }

    for server in originals {
        env.admin
            .delete_volume(server, volume_id)
            .await
            .map_err(|e| Error::EcEncode {
                volume_id,
                server: server.clone(),
                reason: format!("delete original volume: {}", e),
            })?;
    }
    Ok(())
}

async fn restore_writable(env: &EcCommandEnv, volume_id: VolumeId, locations: &[Location]) {
    let admin = env.admin.clone();
    let restored = distributed_operation(locations, move |location| {
        let admin = admin.clone();
        async move { admin.mark_writable(&location.url, volume_id).await }
    })
    .await;
    if let Err(e) = restored {
        tracing::warn!(volume = %volume_id, "restore writable:\n{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::topology::{DataCenterInfo, DataNodeInfo, DiskInfo, RackInfo, VolumeInfo};

    const MB: u64 = 1024 * 1024;

    fn volume(id: u32, size: u64, modified: i64) -> VolumeInfo {
        VolumeInfo {
            id: VolumeId(id),
            size,
            modified_at_second: modified,
            ..Default::default()
        }
    }

    fn topology(nodes: Vec<(&str, u64, Vec<VolumeInfo>)>) -> TopologyInfo {
        TopologyInfo {
            data_centers: vec![DataCenterInfo {
                id: "dc1".into(),
                racks: vec![RackInfo {
                    id: "r1".into(),
                    data_nodes: nodes
                        .into_iter()
                        .map(|(id, free, volumes)| DataNodeInfo {
                            id: id.into(),
                            public_url: id.into(),
                            disk_infos: vec![DiskInfo {
                                max_volume_count: 10,
                                volume_count: 10 - free,
                                free_volume_count: free,
                                volume_infos: volumes,
                                ..Default::default()
                            }],
                        })
                        .collect(),
                }],
            }],
        }
    }

    #[test]
    fn test_fullness_boundary_is_excluded() {
        let now = 10_000;
        // limit 100 MB at 95% -> threshold 95 MB
        let topo = topology(vec![(
            "a",
            5,
            vec![
                volume(1, 95 * MB, 0),
                volume(2, 95 * MB + 1, 0),
                volume(3, 99 * MB, now - 10),
            ],
        )]);
        let ids = collect_volume_ids_for_ec_encode(&topo, 100, "", 95.0, Duration::from_secs(3600), now);
        assert_eq!(ids, vec![VolumeId(2)]);
    }

    #[test]
    fn test_quiet_period_is_strict() {
        let now = 10_000;
        let topo = topology(vec![(
            "a",
            5,
            vec![volume(1, 99 * MB, now - 3600), volume(2, 99 * MB, now - 3601)],
        )]);
        let ids = collect_volume_ids_for_ec_encode(&topo, 100, "", 95.0, Duration::from_secs(3600), now);
        assert_eq!(ids, vec![VolumeId(2)]);
    }

    #[test]
    fn test_collection_remote_and_free_slot_filters() {
        let now = 10_000;
        let mut other = volume(2, 99 * MB, 0);
        other.collection = "logs".into();
        let mut remote = volume(3, 99 * MB, 0);
        remote.remote_storage_name = "s3".into();
        remote.remote_storage_key = "k".into();
        let mut half_remote = volume(4, 99 * MB, 0);
        half_remote.remote_storage_name = "s3".into();

        let topo = topology(vec![
            ("a", 5, vec![volume(1, 99 * MB, 0), other, remote, half_remote, volume(5, 99 * MB, 0)]),
            // volume 5 also lives on a full disk: excluded everywhere
            ("b", 1, vec![volume(5, 99 * MB, 0), volume(6, 99 * MB, 0)]),
            ("c", 2, vec![volume(6, 99 * MB, 0), volume(7, 99 * MB, 0)]),
        ]);
        let ids = collect_volume_ids_for_ec_encode(&topo, 100, "", 95.0, Duration::from_secs(60), now);
        assert_eq!(ids, vec![VolumeId(1), VolumeId(4), VolumeId(7)]);

        let ids = collect_volume_ids_for_ec_encode(&topo, 100, "logs", 95.0, Duration::from_secs(60), now);
        assert_eq!(ids, vec![VolumeId(2)]);
    }

    #[test]
    fn test_options_from_config() {
        let opts = EcEncodeOptions::from_config(&EcConfig::default()).unwrap();
        assert_eq!(opts.full_percent, 95.0);
        assert_eq!(opts.quiet_for, Duration::from_secs(3600));
        assert!(opts.parallelize);
        assert_eq!(opts.min_data_nodes, PARITY_SHARDS_COUNT);
    }

    #[test]
    fn test_rebalance_error_fails_the_report() {
        let mut report = EcEncodeReport {
            encoded: vec![VolumeId(3)],
            ..Default::default()
        };
        assert!(report.is_success());

        report.failures.push((VolumeId(4), Error::VolumeNotFound(VolumeId(4))));
        report.rebalance_error = Some(Error::LockLost);
        assert!(!report.is_success());
        assert_eq!(
            report.failure_summary(),
            "volume 4: Volume 4 not found\nrebalance: lock is lost"
        );
    }
}
