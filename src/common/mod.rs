//! Common utilities and types shared across needlefs

pub mod config;
pub mod ec;
pub mod error;
pub mod hash;
pub mod lock;
pub mod metrics;
pub mod registry;
pub mod topology;
pub mod tracing_middleware;
pub mod types;
pub mod utils;

pub use config::{Config, EcConfig, MasterConfig, VolumeConfig};
pub use error::{Error, FanoutFailures, Result};
pub use hash::{blake3_hash, verify_blake3};
pub use lock::{ClusterLock, LockBackend};
pub use registry::{ConcurrentMap, LockedMap};
pub use types::{FileId, Location, Needle, ReplicaPlacement, Ttl, VolumeId};
pub use utils::{format_bytes, parse_duration, timestamp_now, NodeState};
