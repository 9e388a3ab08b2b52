//! Error types for needlefs

use crate::common::ec::ShardId;
use crate::common::types::VolumeId;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Per-location failures collected by one fan-out batch, sorted by location.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FanoutFailures(pub Vec<(String, String)>);

impl FanoutFailures {
    /// Locations that failed, in order.
    pub fn locations(&self) -> Vec<&str> {
        self.0.iter().map(|(loc, _)| loc.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FanoutFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (location, err)) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "[{}]: {}", location, err)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Volume {0} not found")]
    VolumeNotFound(VolumeId),

    #[error("Volume {0} is read only")]
    VolumeReadOnly(VolumeId),

    #[error("Invalid file id: {0}")]
    InvalidFileId(String),

    #[error("failed to {op} on local disk for volume {volume_id}: {reason}")]
    LocalStore {
        op: &'static str,
        volume_id: VolumeId,
        reason: String,
    },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // === Replication Errors ===
    #[error("replicating lookup failed for {volume_id}: {reason}")]
    Lookup { volume_id: VolumeId, reason: String },

    #[error("{0}")]
    Fanout(FanoutFailures),

    #[error("failed to {op} replicas for volume {volume_id}: {failures}")]
    ReplicaFanout {
        op: &'static str,
        volume_id: VolumeId,
        failures: FanoutFailures,
    },

    #[error("replicating operations [{found}] is less than volume {volume_id} replication copy count [{required}]")]
    UnderProvisioned {
        volume_id: VolumeId,
        found: usize,
        required: usize,
    },

    // === Erasure Coding Errors ===
    #[error("skip erasure coding with {nodes} nodes, less than recommended {required} nodes")]
    InsufficientNodes { nodes: usize, required: usize },

    #[error("not enough free ec shard slots for volume {volume_id}: only {free} left, need {required}")]
    NotEnoughEcSlots {
        volume_id: VolumeId,
        free: usize,
        required: usize,
    },

    #[error("ec encode volume {volume_id} on {server}: {reason}")]
    EcEncode {
        volume_id: VolumeId,
        server: String,
        reason: String,
    },

    #[error("copy ec shards {volume_id}.{shard_ids:?} on {server}: {reason}")]
    ShardCopy {
        volume_id: VolumeId,
        server: String,
        shard_ids: Vec<ShardId>,
        reason: String,
    },

    #[error("Invalid shard id: {0}")]
    InvalidShard(ShardId),

    // === Lock Errors ===
    #[error("lock is lost")]
    LockLost,

    #[error("cluster lock is held by {0}")]
    LockHeld(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::LockHeld(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) | Error::VolumeNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidFileId(_) | Error::InvalidConfig(_) | Error::InvalidShard(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::VolumeReadOnly(_) => StatusCode::FORBIDDEN,
            Error::LockHeld(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::UnderProvisioned { .. } | Error::InsufficientNodes { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.to_http_status();
        (status, axum::Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Internal(format!("bincode: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_failures_display() {
        let failures = FanoutFailures(vec![
            ("10.0.0.1:8080".to_string(), "connection refused".to_string()),
            ("10.0.0.2:8080".to_string(), "500 Internal Server Error".to_string()),
        ]);
        assert_eq!(
            failures.to_string(),
            "[10.0.0.1:8080]: connection refused\n[10.0.0.2:8080]: 500 Internal Server Error"
        );
        assert_eq!(failures.locations(), vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
    }

    #[test]
    fn test_local_store_names_the_operation() {
        let err = Error::LocalStore {
            op: "delete",
            volume_id: VolumeId(4),
            reason: "Volume 4 is read only".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to delete on local disk for volume 4: Volume 4 is read only"
        );
    }

    #[test]
    fn test_http_status_mapping() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::VolumeNotFound(VolumeId(3)).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::VolumeReadOnly(VolumeId(3)).to_http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(Error::LockLost.to_http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
