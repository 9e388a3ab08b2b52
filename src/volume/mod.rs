//! Volume server implementation
//!
//! Handles needle storage with:
//! - Synchronous replication of writes and deletes to sibling replicas
//! - Erasure-coded shard generation, copy and mounting
//! - Periodic heartbeats to the master

pub mod client;
pub mod http;
pub mod replicate;
pub mod server;
pub mod store;

pub use client::{VolumeAdmin, VolumeServerClient};
pub use replicate::{ReplicatedDeleteParams, ReplicatedWriteParams, ReplicationCoordinator};
pub use server::VolumeServer;
pub use store::{LocalStore, MemoryStore};
