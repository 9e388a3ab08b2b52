//! Local volume store
//!
//! Holds the volumes and erasure-coded shards of one volume server in
//! memory. The replication path only sees it through [`LocalStore`].

use crate::common::ec::{ShardBits, ShardId, DATA_SHARDS_COUNT, PARITY_SHARDS_COUNT, TOTAL_SHARDS_COUNT};
use crate::common::topology::{DiskInfo, EcShardInfo, VolumeInfo};
use crate::common::types::NeedleId;
use crate::common::{timestamp_now, Error, Needle, ReplicaPlacement, Result, Ttl, VolumeId};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Local needle primitives used by the replication coordinator.
pub trait LocalStore: Send + Sync {
    fn has_volume(&self, volume_id: VolumeId) -> bool;

    fn replica_placement(&self, volume_id: VolumeId) -> Option<ReplicaPlacement>;

    /// Returns true when the exact same needle was already stored.
    fn write_needle(&self, volume_id: VolumeId, needle: &Needle, fsync: bool) -> Result<bool>;

    /// Returns the number of bytes freed; 0 when the needle was not there.
    fn delete_needle(&self, volume_id: VolumeId, needle: &Needle) -> Result<u64>;
}

#[derive(Debug)]
struct Volume {
    collection: String,
    replica_placement: ReplicaPlacement,
    ttl: Ttl,
    read_only: bool,
    needles: BTreeMap<NeedleId, Needle>,
    size: u64,
    delete_count: u64,
    modified_at_second: i64,
}

impl Volume {
    fn info(&self, id: VolumeId) -> VolumeInfo {
        VolumeInfo {
            id,
            size: self.size,
            collection: self.collection.clone(),
            file_count: self.needles.len() as u64,
            delete_count: self.delete_count,
            read_only: self.read_only,
            replica_placement: self.replica_placement.to_byte(),
            ttl: self.ttl.to_string(),
            modified_at_second: self.modified_at_second,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct EcShard {
    data: Bytes,
    mounted: bool,
}

#[derive(Debug, Default)]
struct EcVolume {
    collection: String,
    shards: BTreeMap<ShardId, EcShard>,
}

impl EcVolume {
    fn bits(&self) -> ShardBits {
        self.shards
            .keys()
            .fold(ShardBits::default(), |bits, &id| bits.add(id))
    }
}

/// In-memory store for one volume server.
#[derive(Debug)]
pub struct MemoryStore {
    max_volume_count: u64,
    volumes: RwLock<HashMap<VolumeId, Volume>>,
    ec_volumes: RwLock<HashMap<VolumeId, EcVolume>>,
}

impl MemoryStore {
    pub fn new(max_volume_count: u64) -> Self {
        Self {
            max_volume_count,
            volumes: RwLock::new(HashMap::new()),
            ec_volumes: RwLock::new(HashMap::new()),
        }
    }

    fn used_slots(&self) -> u64 {
        let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
        let ec = self.ec_volumes.read().unwrap_or_else(|e| e.into_inner());
        let shard_count: usize = ec.values().map(|v| v.shards.len()).sum();
        volumes.len() as u64 + shard_count.div_ceil(DATA_SHARDS_COUNT) as u64
    }

    pub fn allocate_volume(
        &self,
        volume_id: VolumeId,
        collection: &str,
        replica_placement: ReplicaPlacement,
        ttl: Ttl,
    ) -> Result<()> {
        if self.used_slots() >= self.max_volume_count {
            return Err(Error::LocalStore {
                op: "allocate",
                volume_id,
                reason: format!("no free volume slot, max {}", self.max_volume_count),
            });
        }
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        if volumes.contains_key(&volume_id) {
            return Err(Error::LocalStore {
                op: "allocate",
                volume_id,
                reason: "volume already exists".into(),
            });
        }
        volumes.insert(
            volume_id,
            Volume {
                collection: collection.to_string(),
                replica_placement,
                ttl,
                read_only: false,
                needles: BTreeMap::new(),
                size: 0,
                delete_count: 0,
                modified_at_second: timestamp_now() as i64,
            },
        );
        tracing::info!(volume = %volume_id, collection, rp = %replica_placement, "allocated volume");
        Ok(())
    }

    pub fn set_read_only(&self, volume_id: VolumeId, read_only: bool) -> Result<()> {
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        let volume = volumes
            .get_mut(&volume_id)
            .ok_or(Error::VolumeNotFound(volume_id))?;
        volume.read_only = read_only;
        Ok(())
    }

    /// Drop the whole volume. Unknown ids are a no-op.
    pub fn delete_volume(&self, volume_id: VolumeId) -> Result<()> {
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        if volumes.remove(&volume_id).is_some() {
            tracing::info!(volume = %volume_id, "deleted volume");
        }
        Ok(())
    }

    pub fn get_needle(&self, volume_id: VolumeId, key: NeedleId) -> Result<Needle> {
        let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
        let volume = volumes
            .get(&volume_id)
            .ok_or(Error::VolumeNotFound(volume_id))?;
        volume
            .needles
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("needle {:x} in volume {}", key, volume_id)))
    }

    /// Test hook: pretend the volume was last written at `at`.
    pub fn set_modified_at(&self, volume_id: VolumeId, at: i64) -> Result<()> {
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        let volume = volumes
            .get_mut(&volume_id)
            .ok_or(Error::VolumeNotFound(volume_id))?;
        volume.modified_at_second = at;
        Ok(())
    }

    /// Encode the volume into `TOTAL_SHARDS_COUNT` unmounted shards kept
    /// next to the original volume.
    pub fn generate_ec_shards(&self, volume_id: VolumeId, collection: &str) -> Result<Vec<ShardId>> {
        let encoded = {
            let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
            let volume = volumes
                .get(&volume_id)
                .ok_or(Error::VolumeNotFound(volume_id))?;
            if volume.collection != collection {
                return Err(Error::LocalStore {
                    op: "generate ec shards",
                    volume_id,
                    reason: format!(
                        "collection mismatch: volume has {:?}, asked for {:?}",
                        volume.collection, collection
                    ),
                });
            }
            let needles: Vec<&Needle> = volume.needles.values().collect();
            bincode::serialize(&needles)?
        };

        let shards = encode_shards(&encoded).map_err(|reason| Error::LocalStore {
            op: "generate ec shards",
            volume_id,
            reason,
        })?;

        let mut ec = self.ec_volumes.write().unwrap_or_else(|e| e.into_inner());
        let ec_volume = ec.entry(volume_id).or_default();
        ec_volume.collection = collection.to_string();
        for (id, data) in shards.into_iter().enumerate() {
            ec_volume.shards.insert(
                id as ShardId,
                EcShard {
                    data,
                    mounted: false,
                },
            );
        }
        tracing::info!(volume = %volume_id, bytes = encoded.len(), "generated ec shards");
        Ok(ec_volume.bits().ids())
    }

    pub fn read_ec_shard(&self, volume_id: VolumeId, shard_id: ShardId) -> Result<Bytes> {
        let ec = self.ec_volumes.read().unwrap_or_else(|e| e.into_inner());
        ec.get(&volume_id)
            .and_then(|v| v.shards.get(&shard_id))
            .map(|s| s.data.clone())
            .ok_or_else(|| Error::NotFound(format!("ec shard {}.{}", volume_id, shard_id)))
    }

    pub fn store_ec_shard(
        &self,
        volume_id: VolumeId,
        collection: &str,
        shard_id: ShardId,
        data: Bytes,
    ) -> Result<()> {
        if shard_id as usize >= TOTAL_SHARDS_COUNT {
            return Err(Error::InvalidShard(shard_id));
        }
        let mut ec = self.ec_volumes.write().unwrap_or_else(|e| e.into_inner());
        let ec_volume = ec.entry(volume_id).or_default();
        ec_volume.collection = collection.to_string();
        ec_volume.shards.insert(
            shard_id,
            EcShard {
                data,
                mounted: false,
            },
        );
        Ok(())
    }

    pub fn mount_ec_shards(&self, volume_id: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        let mut ec = self.ec_volumes.write().unwrap_or_else(|e| e.into_inner());
        let ec_volume = ec
            .get_mut(&volume_id)
            .ok_or_else(|| Error::NotFound(format!("ec volume {}", volume_id)))?;
        if let Some(missing) = shard_ids.iter().find(|id| !ec_volume.shards.contains_key(id)) {
            return Err(Error::NotFound(format!("ec shard {}.{}", volume_id, missing)));
        }
        for id in shard_ids {
            if let Some(shard) = ec_volume.shards.get_mut(id) {
                shard.mounted = true;
            }
        }
        Ok(())
    }

    /// Unknown shards are skipped so cleanup can be repeated.
    pub fn unmount_ec_shards(&self, volume_id: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        let mut ec = self.ec_volumes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ec_volume) = ec.get_mut(&volume_id) {
            for id in shard_ids {
                if let Some(shard) = ec_volume.shards.get_mut(id) {
                    shard.mounted = false;
                }
            }
        }
        Ok(())
    }

    pub fn delete_ec_shards(&self, volume_id: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        let mut ec = self.ec_volumes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ec_volume) = ec.get_mut(&volume_id) {
            for id in shard_ids {
                ec_volume.shards.remove(id);
            }
            if ec_volume.shards.is_empty() {
                ec.remove(&volume_id);
            }
        }
        Ok(())
    }

    pub fn ec_shard_bits(&self, volume_id: VolumeId) -> ShardBits {
        let ec = self.ec_volumes.read().unwrap_or_else(|e| e.into_inner());
        ec.get(&volume_id).map(EcVolume::bits).unwrap_or_default()
    }

    pub fn mounted_ec_shards(&self, volume_id: VolumeId) -> ShardBits {
        let ec = self.ec_volumes.read().unwrap_or_else(|e| e.into_inner());
        ec.get(&volume_id)
            .map(|v| {
                v.shards
                    .iter()
                    .filter(|(_, s)| s.mounted)
                    .fold(ShardBits::default(), |bits, (&id, _)| bits.add(id))
            })
            .unwrap_or_default()
    }

    /// Snapshot for heartbeats.
    pub fn disk_info(&self) -> DiskInfo {
        let used = self.used_slots();
        let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
        let ec = self.ec_volumes.read().unwrap_or_else(|e| e.into_inner());

        let mut volume_infos: Vec<VolumeInfo> = volumes.iter().map(|(id, v)| v.info(*id)).collect();
        volume_infos.sort_by_key(|v| v.id);
        let mut ec_shard_infos: Vec<EcShardInfo> = ec
            .iter()
            .map(|(id, v)| EcShardInfo {
                id: *id,
                collection: v.collection.clone(),
                ec_index_bits: v.bits(),
            })
            .collect();
        ec_shard_infos.sort_by_key(|s| s.id);

        DiskInfo {
            disk_type: String::new(),
            max_volume_count: self.max_volume_count,
            volume_count: volumes.len() as u64,
            free_volume_count: self.max_volume_count.saturating_sub(used),
            volume_infos,
            ec_shard_infos,
        }
    }
}

impl LocalStore for MemoryStore {
    fn has_volume(&self, volume_id: VolumeId) -> bool {
        let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
        volumes.contains_key(&volume_id)
    }

    fn replica_placement(&self, volume_id: VolumeId) -> Option<ReplicaPlacement> {
        let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
        volumes.get(&volume_id).map(|v| v.replica_placement)
    }

    // memory-backed: fsync has nothing to flush
    fn write_needle(&self, volume_id: VolumeId, needle: &Needle, _fsync: bool) -> Result<bool> {
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        let volume = volumes
            .get_mut(&volume_id)
            .ok_or(Error::VolumeNotFound(volume_id))?;
        if volume.read_only {
            return Err(Error::VolumeReadOnly(volume_id));
        }
        if let Some(existing) = volume.needles.get(&needle.id) {
            if existing.cookie != needle.cookie {
                return Err(Error::LocalStore {
                    op: "write",
                    volume_id,
                    reason: format!("mismatching cookie for needle {:x}", needle.id),
                });
            }
            if existing.data == needle.data && existing.name == needle.name {
                return Ok(true);
            }
        }
        volume.size += needle.disk_size();
        volume.modified_at_second = timestamp_now() as i64;
        volume.needles.insert(needle.id, needle.clone());
        Ok(false)
    }

    fn delete_needle(&self, volume_id: VolumeId, needle: &Needle) -> Result<u64> {
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        let volume = volumes
            .get_mut(&volume_id)
            .ok_or(Error::VolumeNotFound(volume_id))?;
        if volume.read_only {
            return Err(Error::VolumeReadOnly(volume_id));
        }
        match volume.needles.get(&needle.id) {
            None => Ok(0),
            Some(existing) if existing.cookie != needle.cookie => Err(Error::LocalStore {
                op: "delete",
                volume_id,
                reason: format!("mismatching cookie for needle {:x}", needle.id),
            }),
            Some(_) => {
                let freed = volume
                    .needles
                    .remove(&needle.id)
                    .map(|n| n.disk_size())
                    .unwrap_or(0);
                volume.delete_count += 1;
                volume.modified_at_second = timestamp_now() as i64;
                Ok(freed)
            }
        }
    }
}

/// Split `data` into data shards (zero padded, even sized) plus parity.
fn encode_shards(data: &[u8]) -> std::result::Result<Vec<Bytes>, String> {
    let mut shard_size = data.len().div_ceil(DATA_SHARDS_COUNT).max(2);
    if shard_size % 2 != 0 {
        shard_size += 1;
    }
    let mut padded = Vec::with_capacity(shard_size * DATA_SHARDS_COUNT);
    padded.extend_from_slice(data);
    padded.resize(shard_size * DATA_SHARDS_COUNT, 0);

    let originals: Vec<&[u8]> = padded.chunks_exact(shard_size).collect();
    let recovery = reed_solomon_simd::encode(DATA_SHARDS_COUNT, PARITY_SHARDS_COUNT, &originals)
        .map_err(|e| format!("reed-solomon: {}", e))?;

    Ok(originals
        .into_iter()
        .map(Bytes::copy_from_slice)
        .chain(recovery.into_iter().map(Bytes::from))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_volume(rp: &str) -> MemoryStore {
        let store = MemoryStore::new(4);
        store
            .allocate_volume(VolumeId(1), "pics", rp.parse().unwrap(), Ttl::default())
            .unwrap();
        store
    }

    #[test]
    fn test_write_read_delete() {
        let store = store_with_volume("001");
        assert!(store.has_volume(VolumeId(1)));
        assert_eq!(store.replica_placement(VolumeId(1)).unwrap().copy_count(), 2);

        let n = Needle::new(7, 42, b"hello".to_vec());
        assert!(!store.write_needle(VolumeId(1), &n, false).unwrap());
        assert!(store.write_needle(VolumeId(1), &n, false).unwrap());
        assert_eq!(store.get_needle(VolumeId(1), 7).unwrap().data, b"hello");

        let freed = store.delete_needle(VolumeId(1), &n).unwrap();
        assert_eq!(freed, n.disk_size());
        assert_eq!(store.delete_needle(VolumeId(1), &n).unwrap(), 0);
    }

    #[test]
    fn test_cookie_mismatch_and_readonly() {
        let store = store_with_volume("000");
        store
            .write_needle(VolumeId(1), &Needle::new(7, 42, b"a".to_vec()), false)
            .unwrap();
        let forged = Needle::new(7, 43, b"b".to_vec());
        assert!(matches!(
            store.write_needle(VolumeId(1), &forged, false),
            Err(Error::LocalStore { .. })
        ));

        store.set_read_only(VolumeId(1), true).unwrap();
        assert!(matches!(
            store.write_needle(VolumeId(1), &Needle::new(8, 1, b"c".to_vec()), false),
            Err(Error::VolumeReadOnly(_))
        ));
        assert!(matches!(
            store.write_needle(VolumeId(9), &Needle::new(8, 1, b"c".to_vec()), false),
            Err(Error::VolumeNotFound(_))
        ));
    }

    #[test]
    fn test_generated_shards_reconstruct_from_any_data_count() {
        let store = store_with_volume("000");
        for i in 0..20u64 {
            let n = Needle::new(i, 1, vec![i as u8; 100 + i as usize]);
            store.write_needle(VolumeId(1), &n, false).unwrap();
        }
        let ids = store.generate_ec_shards(VolumeId(1), "pics").unwrap();
        assert_eq!(ids.len(), TOTAL_SHARDS_COUNT);
        assert!(store.ec_shard_bits(VolumeId(1)).is_complete());
        assert_eq!(store.mounted_ec_shards(VolumeId(1)).count(), 0);

        let shard = |id: ShardId| store.read_ec_shard(VolumeId(1), id).unwrap();
        // lose data shards 0..4, rebuild from 6 data + 4 parity
        let originals: Vec<(usize, Bytes)> = (4..DATA_SHARDS_COUNT)
            .map(|i| (i, shard(i as ShardId)))
            .collect();
        let recovery: Vec<(usize, Bytes)> = (0..PARITY_SHARDS_COUNT)
            .map(|i| (i, shard((DATA_SHARDS_COUNT + i) as ShardId)))
            .collect();
        let restored =
            reed_solomon_simd::decode(DATA_SHARDS_COUNT, PARITY_SHARDS_COUNT, originals, recovery)
                .unwrap();
        for i in 0..4 {
            assert_eq!(restored[&i], shard(i as ShardId).to_vec());
        }
    }

    #[test]
    fn test_generate_requires_matching_collection() {
        let store = store_with_volume("000");
        assert!(store.generate_ec_shards(VolumeId(1), "other").is_err());
        assert!(store.generate_ec_shards(VolumeId(2), "pics").is_err());
    }

    #[test]
    fn test_shard_mount_unmount_delete() {
        let store = MemoryStore::new(4);
        store
            .store_ec_shard(VolumeId(5), "", 3, Bytes::from_static(b"xy"))
            .unwrap();
        assert!(store.mount_ec_shards(VolumeId(5), &[3, 4]).is_err());
        store.mount_ec_shards(VolumeId(5), &[3]).unwrap();
        assert!(store.mounted_ec_shards(VolumeId(5)).has(3));

        store.unmount_ec_shards(VolumeId(5), &[3, 9]).unwrap();
        assert_eq!(store.mounted_ec_shards(VolumeId(5)).count(), 0);

        store.delete_ec_shards(VolumeId(5), &[3]).unwrap();
        assert_eq!(store.ec_shard_bits(VolumeId(5)).count(), 0);
        assert!(store.disk_info().ec_shard_infos.is_empty());
        assert!(matches!(
            store.store_ec_shard(VolumeId(5), "", 14, Bytes::new()),
            Err(Error::InvalidShard(14))
        ));
    }

    #[test]
    fn test_disk_info_counts_slots() {
        let store = store_with_volume("000");
        store
            .allocate_volume(VolumeId(2), "pics", ReplicaPlacement::default(), Ttl::default())
            .unwrap();
        let info = store.disk_info();
        assert_eq!(info.volume_count, 2);
        assert_eq!(info.free_volume_count, 2);
        assert_eq!(info.volume_infos[0].collection, "pics");
    }
}
