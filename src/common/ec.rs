//! Erasure-coding layout constants and the shard bitset

use serde::{Deserialize, Serialize};

pub const DATA_SHARDS_COUNT: usize = 10;
pub const PARITY_SHARDS_COUNT: usize = 4;
pub const TOTAL_SHARDS_COUNT: usize = DATA_SHARDS_COUNT + PARITY_SHARDS_COUNT;

pub type ShardId = u8;

/// Set of shard ids held by one server for one volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardBits(pub u32);

impl ShardBits {
    pub fn from_ids(ids: &[ShardId]) -> Self {
        ids.iter().fold(ShardBits(0), |bits, &id| bits.add(id))
    }

    pub fn add(self, id: ShardId) -> Self {
        ShardBits(self.0 | (1 << id))
    }

    pub fn remove(self, id: ShardId) -> Self {
        ShardBits(self.0 & !(1 << id))
    }

    pub fn plus(self, other: ShardBits) -> Self {
        ShardBits(self.0 | other.0)
    }

    pub fn has(self, id: ShardId) -> bool {
        self.0 & (1 << id) != 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn ids(self) -> Vec<ShardId> {
        (0..TOTAL_SHARDS_COUNT as ShardId)
            .filter(|&id| self.has(id))
            .collect()
    }

    pub fn is_complete(self) -> bool {
        self.count() == TOTAL_SHARDS_COUNT
    }
}
