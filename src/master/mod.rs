//! Master: the location directory for volumes
//!
//! The master is responsible for:
//! - Tracking volume servers through heartbeats
//! - Answering volume location lookups
//! - Serving the cluster topology to operator commands
//! - Leasing the cluster admin lock

pub mod http;
pub mod lock;
pub mod server;
pub mod topology;

pub use lock::LockTable;
pub use server::Master;
pub use topology::Topology;
