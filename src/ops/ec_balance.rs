//! `ec.balance`: spread erasure-coded volumes whose complete shard set still
//! sits on a single server, e.g. after an interrupted `ec.encode`.

use crate::common::topology::TopologyInfo;
use crate::common::{ClusterLock, Error, Result, VolumeId};
use crate::ops::ec_encode::spread_ec_shards;
use crate::ops::EcCommandEnv;

/// A volume whose shards are all on `server`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcentratedVolume {
    pub volume_id: VolumeId,
    pub collection: String,
    pub server: String,
}

#[derive(Debug, Default)]
pub struct EcBalanceReport {
    pub planned: Vec<ConcentratedVolume>,
    pub moved: Vec<VolumeId>,
    pub failures: Vec<(VolumeId, Error)>,
}

/// Volumes of `collections` (all when empty) with a complete shard set on
/// one server, sorted by volume id.
pub fn find_concentrated_ec_volumes(topology: &TopologyInfo, collections: &[String]) -> Vec<ConcentratedVolume> {
    let mut found = Vec::new();
    for (_, _, dn) in topology.data_nodes() {
        for shard in dn.disk_infos.iter().flat_map(|d| d.ec_shard_infos.iter()) {
            if !collections.is_empty() && !collections.contains(&shard.collection) {
                continue;
            }
            if !dn.ec_shard_bits(shard.id).is_complete() {
                continue;
            }
            let candidate = ConcentratedVolume {
                volume_id: shard.id,
                collection: shard.collection.clone(),
                server: dn.id.clone(),
            };
            if !found.contains(&candidate) {
                found.push(candidate);
            }
        }
    }
    found.sort_by(|a, b| a.volume_id.cmp(&b.volume_id).then_with(|| a.server.cmp(&b.server)));
    found
}

/// Plan, and with `apply` perform, the spreading. A dry run only logs.
pub async fn ec_balance(
    env: &EcCommandEnv,
    lock: &ClusterLock,
    collections: &[String],
    parallelize: bool,
    apply: bool,
) -> Result<EcBalanceReport> {
    lock.confirm_is_locked()?;

    let topology = env.topology.topology_info().await?;
    let mut report = EcBalanceReport {
        planned: find_concentrated_ec_volumes(&topology.topology, collections),
        ..Default::default()
    };

    for volume in &report.planned {
        tracing::info!(
            volume = %volume.volume_id,
            collection = %volume.collection,
            "ec shards concentrated on {}",
            volume.server
        );
    }
    if !apply {
        return Ok(report);
    }

    for volume in report.planned.clone() {
        let spread = spread_ec_shards(
            env,
            lock,
            volume.volume_id,
            &volume.collection,
            &volume.server,
            parallelize,
        )
        .await;
        match spread {
            Ok(()) => report.moved.push(volume.volume_id),
            Err(e) => {
                tracing::error!(volume = %volume.volume_id, "ec balance: {}", e);
                report.failures.push((volume.volume_id, e));
            }
        }
    }
    Ok(report)
}
