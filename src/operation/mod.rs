//! Client-side operations against the master and other volume servers

pub mod distributed;
pub mod lookup;
pub mod upload;

pub use distributed::{distributed_operation, distributed_operation_results, DistributedOperationResult};
pub use lookup::{Heartbeat, LocationDirectory, MasterClient, TopologySource};
pub use upload::{HttpReplicaClient, ReplicaClient, ReplicaUpload};

use crate::common::{Error, Result};
use reqwest::StatusCode;

/// Turn a non-2xx response into an error carrying the status and body.
pub(crate) async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body = body.trim();
    Err(match status {
        StatusCode::NOT_FOUND => Error::NotFound(body.to_string()),
        StatusCode::CONFLICT => Error::LockHeld(body.to_string()),
        _ if body.is_empty() => Error::Http(status.to_string()),
        _ => Error::Http(format!("{}: {}", status, body)),
    })
}

/// `host:port` or a full URL, as an `http://` base without trailing slash.
pub(crate) fn http_base(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_base() {
        assert_eq!(http_base("10.0.0.1:8080"), "http://10.0.0.1:8080");
        assert_eq!(http_base("http://master:9333/"), "http://master:9333");
    }
}
