//! Operator commands that place data across the cluster
//!
//! Every command runs under the cluster admin lock and works on a fresh
//! topology snapshot fetched from the master.

pub mod ec_balance;
pub mod ec_common;
pub mod ec_encode;

pub use ec_balance::{ec_balance, find_concentrated_ec_volumes, ConcentratedVolume, EcBalanceReport};
pub use ec_common::{balanced_ec_distribution, collect_ec_nodes, EcNode, SourceRole};
pub use ec_encode::{collect_volume_ids_for_ec_encode, ec_encode, EcEncodeOptions, EcEncodeReport};

use crate::operation::{LocationDirectory, TopologySource};
use crate::volume::VolumeAdmin;
use std::sync::Arc;

/// The cluster services a command talks to.
#[derive(Clone)]
pub struct EcCommandEnv {
    pub topology: Arc<dyn TopologySource>,
    pub directory: Arc<dyn LocationDirectory>,
    pub admin: Arc<dyn VolumeAdmin>,
}
