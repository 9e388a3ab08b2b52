//! Configuration for needlefs components
//!
//! Values come from an optional `needlefs.toml` (or the file named by
//! `NEEDLEFS_CONFIG`) overlaid with `NEEDLEFS_*` environment variables,
//! e.g. `NEEDLEFS_VOLUME__MAX_VOLUME_COUNT=16`. Command line flags win over both.

use crate::common::ec::PARITY_SHARDS_COUNT;
use crate::common::{parse_duration, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Master-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<MasterConfig>,

    /// Volume-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeConfig>,

    /// Defaults for the `ec.encode` command
    #[serde(default)]
    pub ec: EcConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from file + environment. A missing file is not an error.
    pub fn load() -> Result<Self> {
        let file = std::env::var("NEEDLEFS_CONFIG").unwrap_or_else(|_| "needlefs".to_string());
        Self::load_from(&file)
    }

    pub fn load_from(file: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("NEEDLEFS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let mut config: Config = settings.try_deserialize()?;
        if config.log_level.is_empty() {
            config.log_level = default_log_level();
        }
        Ok(config)
    }
}

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_master_bind")]
    pub bind_addr: SocketAddr,

    /// Volumes stop taking writes past this size
    #[serde(default = "default_volume_size_limit_mb")]
    pub volume_size_limit_mb: u64,

    /// A data node missing heartbeats this long is considered dead
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,

    /// Lease of the admin cluster lock; holders renew at a third of it
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

fn default_master_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9333))
}
fn default_volume_size_limit_mb() -> u64 {
    30_000
}
fn default_node_timeout() -> u64 {
    30
}
fn default_lock_ttl() -> u64 {
    60
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_master_bind(),
            volume_size_limit_mb: default_volume_size_limit_mb(),
            node_timeout_secs: default_node_timeout(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

/// Volume server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_volume_bind")]
    pub bind_addr: SocketAddr,

    /// Advertised `ip:port`; replica lookups compare against it
    #[serde(default = "default_volume_url")]
    pub url: String,

    /// Public `ip:port` handed to clients
    #[serde(default)]
    pub public_url: String,

    /// Master base URL
    #[serde(default = "default_master_url")]
    pub master_url: String,

    #[serde(default = "default_data_center")]
    pub data_center: String,

    #[serde(default = "default_rack")]
    pub rack: String,

    /// Volume slots on this server
    #[serde(default = "default_max_volume_count")]
    pub max_volume_count: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Timeout for each replica / shard request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Max upload body size
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_volume_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_volume_url() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_master_url() -> String {
    "http://127.0.0.1:9333".to_string()
}
fn default_data_center() -> String {
    "DefaultDataCenter".to_string()
}
fn default_rack() -> String {
    "DefaultRack".to_string()
}
fn default_max_volume_count() -> u64 {
    8
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

impl VolumeConfig {
    pub fn public_url(&self) -> &str {
        if self.public_url.is_empty() {
            &self.url
        } else {
            &self.public_url
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_volume_bind(),
            url: default_volume_url(),
            public_url: String::new(),
            master_url: default_master_url(),
            data_center: default_data_center(),
            rack: default_rack(),
            max_volume_count: default_max_volume_count(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Erasure-coding command defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcConfig {
    /// Minimum volume fullness, in percent of the size limit
    #[serde(default = "default_full_percent")]
    pub full_percent: f64,

    /// Minimum time without writes, e.g. "1h"
    #[serde(default = "default_quiet_for")]
    pub quiet_for: String,

    /// Copy shards to all targets concurrently
    #[serde(default = "default_parallelize")]
    pub parallelize: bool,

    /// Encoding is refused below this many data nodes unless forced
    #[serde(default = "default_min_data_nodes")]
    pub min_data_nodes: usize,
}

fn default_full_percent() -> f64 {
    95.0
}
fn default_quiet_for() -> String {
    "1h".to_string()
}
fn default_parallelize() -> bool {
    true
}
fn default_min_data_nodes() -> usize {
    PARITY_SHARDS_COUNT
}

impl EcConfig {
    pub fn quiet_period(&self) -> Result<Duration> {
        parse_duration(&self.quiet_for)
    }
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            full_percent: default_full_percent(),
            quiet_for: default_quiet_for(),
            parallelize: default_parallelize(),
            min_data_nodes: default_min_data_nodes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let ec = EcConfig::default();
        assert_eq!(ec.min_data_nodes, 4);
        assert_eq!(ec.quiet_period().unwrap(), Duration::from_secs(3600));

        let vol = VolumeConfig::default();
        assert_eq!(vol.public_url(), "127.0.0.1:8080");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[volume]
url = "10.0.0.5:8080"
max_volume_count = 16

[ec]
full_percent = 80.0
quiet_for = "30m"
"#
        )
        .unwrap();

        let path = file.path().with_extension("");
        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.log_level, "debug");
        let vol = config.volume.unwrap();
        assert_eq!(vol.url, "10.0.0.5:8080");
        assert_eq!(vol.max_volume_count, 16);
        assert_eq!(vol.rack, "DefaultRack");
        assert_eq!(config.ec.full_percent, 80.0);
        assert_eq!(config.ec.quiet_period().unwrap(), Duration::from_secs(1800));
        assert!(config.master.is_none());
    }
}
