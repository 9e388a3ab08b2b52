//! # needlefs
//!
//! A blob store built from volume servers and a master:
//! - Synchronous replication of every write and delete to all replicas
//! - Erasure coding of sealed volumes into 10 data + 4 parity shards
//! - Round-robin shard placement across the cluster under an admin lock
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │           Master             │
//!            │  heartbeats, lookups, lock   │
//!            └──────────────┬───────────────┘
//!                           │ HTTP/JSON
//!   ┌───────────────────────┼───────────────────────┐
//!   │                       │                       │
//! ┌─▼──────────┐      ┌─────▼──────┐         ┌──────▼─────┐
//! │ Volume A   │◄────►│ Volume B   │◄───────►│ Volume C   │
//! │ replicas + │      │ replicas + │         │ replicas + │
//! │ ec shards  │      │ ec shards  │         │ ec shards  │
//! └────────────┘      └────────────┘         └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a master
//! ```bash
//! needlefs-master serve --bind 0.0.0.0:9333
//! ```
//!
//! ### Start a volume server
//! ```bash
//! needlefs-volume serve \
//!   --bind 0.0.0.0:8080 \
//!   --url 10.0.0.1:8080 \
//!   --master http://10.0.0.10:9333
//! ```
//!
//! ### Operator commands
//! ```bash
//! # Allocate a volume replicated on two servers of the same rack
//! needlefs volume.allocate --volume-id 3 --replication 001 --server 10.0.0.1:8080 --server 10.0.0.2:8080
//!
//! # Erasure-code full and quiet volumes of a collection
//! needlefs ec.encode --collection pics --full-percent 95 --quiet-for 1h
//!
//! # Spread shard sets still sitting on one server
//! needlefs ec.balance --apply
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod master;
pub mod operation;
pub mod ops;
pub mod volume;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use master::Master;
pub use volume::VolumeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
