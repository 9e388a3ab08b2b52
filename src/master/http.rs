//! HTTP API for the master
//!
//! - `POST /cluster/heartbeat` volume servers report their volumes and shards
//! - `GET /dir/lookup?volumeId=` replica locations of a volume
//! - `GET /cluster/topology` the data center / rack / node tree
//! - `POST /cluster/lock`, `POST /cluster/unlock` the admin lock

use crate::common::metrics::METRICS;
use crate::common::topology::TopologyResponse;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, LockBackend, VolumeId};
use crate::master::lock::LockTable;
use crate::master::topology::Topology;
use crate::operation::lookup::{HeartbeatResponse, LockRequest, LockResponse, LookupResponse};
use crate::operation::Heartbeat;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct MasterState {
    pub topology: Arc<Topology>,
    pub locks: Arc<LockTable>,
}

pub fn create_router(state: MasterState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/cluster/heartbeat", post(heartbeat))
        .route("/cluster/topology", get(topology))
        .route("/cluster/lock", post(lock))
        .route("/cluster/unlock", post(unlock))
        .route("/dir/lookup", get(lookup))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

async fn heartbeat(State(state): State<MasterState>, Json(hb): Json<Heartbeat>) -> Response {
    if hb.url.is_empty() {
        return Error::InvalidConfig("heartbeat without url".into()).into_response();
    }
    state.topology.register_heartbeat(hb);
    Json(HeartbeatResponse {
        volume_size_limit_mb: state.topology.volume_size_limit_mb(),
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupQuery {
    volume_id: String,
}

async fn lookup(State(state): State<MasterState>, Query(query): Query<LookupQuery>) -> Response {
    // "3" or a full file id "3,01637037d6"
    let vid = query.volume_id.split(',').next().unwrap_or_default();
    let volume_id: VolumeId = match vid.parse() {
        Ok(v) => v,
        Err(_) => return Error::InvalidFileId(query.volume_id).into_response(),
    };
    let locations = state.topology.lookup_volume(volume_id);
    if locations.is_empty() {
        return Error::NotFound(format!("volume {} not found", volume_id)).into_response();
    }
    Json(LookupResponse {
        volume_id,
        locations,
    })
    .into_response()
}

async fn topology(State(state): State<MasterState>) -> impl IntoResponse {
    Json(TopologyResponse {
        topology: state.topology.topology_info(),
        volume_size_limit_mb: state.topology.volume_size_limit_mb(),
    })
}

async fn lock(State(state): State<MasterState>, Json(req): Json<LockRequest>) -> Response {
    match state.locks.acquire(&req.owner).await {
        Ok(lease) => Json(LockResponse {
            lease_ms: lease.as_millis() as u64,
        })
        .into_response(),
        Err(Error::LockHeld(holder)) => (StatusCode::CONFLICT, holder).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn unlock(State(state): State<MasterState>, Json(req): Json<LockRequest>) -> Response {
    match state.locks.release(&req.owner).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn status(State(state): State<MasterState>) -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "data_nodes": state.topology.node_count(),
        "volume_size_limit_mb": state.topology.volume_size_limit_mb(),
        "lock_holder": state.locks.holder(),
        "uptime_secs": METRICS.uptime_seconds(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn metrics(State(state): State<MasterState>) -> impl IntoResponse {
    let mut out = format!("needlefs_data_nodes {}\n", state.topology.node_count());
    out += &METRICS.to_prometheus();
    (StatusCode::OK, out)
}
