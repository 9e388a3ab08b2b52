//! HTTP API of a volume server
//!
//! - `PUT|POST|GET|DELETE /:fid` needle traffic (`type=replicate` marks a
//!   forwarded replica request)
//! - `/admin/volume/*` and `/admin/ec/*` for the placement commands
//! - `/status`, `/metrics`

use crate::common::ec::ShardId;
use crate::common::metrics::{EC_SHARD_COPY, METRICS};
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::types::PAIR_NAME_PREFIX;
use crate::common::{blake3_hash, timestamp_now, Error, FileId, Needle, ReplicaPlacement, Result, Ttl, VolumeId};
use crate::volume::client::{
    AllocateVolumeRequest, CopyEcShardsRequest, CopyEcShardsResponse, EcShardsRequest,
    GenerateEcShardsRequest, VolumeRequest, VolumeServerClient, SHARD_DIGEST_HEADER,
};
use crate::volume::replicate::{ReplicatedDeleteParams, ReplicatedWriteParams, ReplicationCoordinator};
use crate::volume::store::MemoryStore;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::future::try_join_all;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

#[derive(Clone)]
pub struct VolumeState {
    pub store: Arc<MemoryStore>,
    pub replication: Arc<ReplicationCoordinator>,
    /// Pulls shards from other servers during `/admin/ec/copy`.
    pub peers: Arc<VolumeServerClient>,
    /// This server's `ip:port`
    pub url: String,
}

pub fn create_router(state: VolumeState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/admin/volume/allocate", post(allocate_volume))
        .route("/admin/volume/readonly", post(mark_readonly))
        .route("/admin/volume/writable", post(mark_writable))
        .route("/admin/volume/delete", post(delete_volume))
        .route("/admin/ec/generate", post(generate_ec_shards))
        .route("/admin/ec/copy", post(copy_ec_shards))
        .route("/admin/ec/mount", post(mount_ec_shards))
        .route("/admin/ec/unmount", post(unmount_ec_shards))
        .route("/admin/ec/delete", post(delete_ec_shards))
        .route("/admin/ec/shard", get(read_ec_shard))
        .route(
            "/:fid",
            get(get_needle)
                .put(write_needle)
                .post(write_needle)
                .delete(delete_needle),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct NeedleQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    ttl: Option<String>,
    ts: Option<u64>,
    cm: Option<bool>,
    fsync: Option<bool>,
}

impl NeedleQuery {
    fn is_replicate(&self) -> bool {
        self.kind.as_deref() == Some("replicate")
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, header::AUTHORIZATION)?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_string())
}

/// `inline; filename="a.txt"` -> `a.txt`
fn disposition_filename(headers: &HeaderMap) -> String {
    header_str(headers, header::CONTENT_DISPOSITION)
        .and_then(|v| v.split(';').find_map(|part| part.trim().strip_prefix("filename=")))
        .map(|name| name.trim_matches('"').to_string())
        .unwrap_or_default()
}

/// `Seaweed-*` headers back into the pair JSON object.
fn pairs_from_headers(headers: &HeaderMap) -> Option<Vec<u8>> {
    let prefix = PAIR_NAME_PREFIX.to_ascii_lowercase();
    let pairs: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(prefix.as_str())?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();
    if pairs.is_empty() {
        None
    } else {
        serde_json::to_vec(&pairs).ok()
    }
}

fn needle_from_request(fid: &FileId, query: &NeedleQuery, headers: &HeaderMap, body: Bytes) -> Result<Needle> {
    let mut needle = Needle::new(fid.key, fid.cookie, body.to_vec());
    needle.name = disposition_filename(headers);
    needle.mime = header_str(headers, header::CONTENT_TYPE)
        .unwrap_or_default()
        .to_string();
    needle.is_compressed = header_str(headers, header::CONTENT_ENCODING) == Some("gzip");
    needle.is_chunk_manifest = query.cm.unwrap_or(false);
    needle.last_modified = query.ts.unwrap_or_else(timestamp_now);
    needle.ttl = Ttl::parse(query.ttl.as_deref().unwrap_or_default())?;
    needle.pairs = pairs_from_headers(headers);
    Ok(needle)
}

async fn write_needle(
    State(state): State<VolumeState>,
    Path(fid): Path<String>,
    Query(query): Query<NeedleQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        let fid: FileId = fid.parse()?;
        let needle = needle_from_request(&fid, &query, &headers, body)?;
        let size = needle.data.len();
        let name = needle.name.clone();
        let unchanged = state
            .replication
            .replicated_write(ReplicatedWriteParams {
                volume_id: fid.volume_id,
                needle,
                jwt: bearer_token(&headers),
                replicate: query.is_replicate(),
                fsync: query.fsync.unwrap_or(false),
                content_md5: header_str(&headers, "Content-MD5").map(str::to_string),
            })
            .await?;
        Ok::<_, Error>((name, size, unchanged))
    }
    .await;

    match result {
        Ok((name, size, unchanged)) => (
            StatusCode::CREATED,
            Json(json!({ "name": name, "size": size, "unchanged": unchanged })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_needle(State(state): State<VolumeState>, Path(fid): Path<String>) -> Response {
    let result = fid.parse::<FileId>().and_then(|fid| {
        let needle = state.store.get_needle(fid.volume_id, fid.key)?;
        if needle.cookie != fid.cookie {
            return Err(Error::NotFound(fid.to_string()));
        }
        Ok(needle)
    });
    match result {
        Ok(needle) => {
            let mime = if needle.mime.is_empty() {
                "application/octet-stream".to_string()
            } else {
                needle.mime
            };
            ([(header::CONTENT_TYPE, mime)], needle.data).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn delete_needle(
    State(state): State<VolumeState>,
    Path(fid): Path<String>,
    Query(query): Query<NeedleQuery>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        let fid: FileId = fid.parse()?;
        state
            .replication
            .replicated_delete(ReplicatedDeleteParams {
                volume_id: fid.volume_id,
                needle: Needle::new(fid.key, fid.cookie, Vec::new()),
                jwt: bearer_token(&headers),
                replicate: query.is_replicate(),
            })
            .await
    }
    .await;

    match result {
        Ok(size) => (StatusCode::ACCEPTED, Json(json!({ "size": size }))).into_response(),
        Err(e) => e.into_response(),
    }
}

fn ok_or_error(result: Result<()>) -> Response {
    match result {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn allocate_volume(
    State(state): State<VolumeState>,
    Json(req): Json<AllocateVolumeRequest>,
) -> Response {
    let result = (|| {
        let rp: ReplicaPlacement = if req.replication.is_empty() {
            ReplicaPlacement::default()
        } else {
            req.replication.parse()?
        };
        state
            .store
            .allocate_volume(req.volume_id, &req.collection, rp, Ttl::parse(&req.ttl)?)
    })();
    ok_or_error(result)
}

async fn mark_readonly(State(state): State<VolumeState>, Json(req): Json<VolumeRequest>) -> Response {
    ok_or_error(state.store.set_read_only(req.volume_id, true))
}

async fn mark_writable(State(state): State<VolumeState>, Json(req): Json<VolumeRequest>) -> Response {
    ok_or_error(state.store.set_read_only(req.volume_id, false))
}

async fn delete_volume(State(state): State<VolumeState>, Json(req): Json<VolumeRequest>) -> Response {
    ok_or_error(state.store.delete_volume(req.volume_id))
}

async fn generate_ec_shards(
    State(state): State<VolumeState>,
    Json(req): Json<GenerateEcShardsRequest>,
) -> Response {
    let store = state.store.clone();
    // encoding is CPU bound
    let result = tokio::task::spawn_blocking(move || store.generate_ec_shards(req.volume_id, &req.collection))
        .await
        .map_err(|e| Error::Internal(e.to_string()))
        .and_then(|r| r);
    match result {
        Ok(ids) => Json(json!({ "shard_ids": ids })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn copy_ec_shards(
    State(state): State<VolumeState>,
    Json(req): Json<CopyEcShardsRequest>,
) -> Response {
    let stage = METRICS.stage(EC_SHARD_COPY).start();
    let result = copy_shards_from(&state, &req).await;
    stage.finish(result.is_ok());
    match result {
        Ok(shard_ids) => Json(CopyEcShardsResponse { shard_ids }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn copy_shards_from(state: &VolumeState, req: &CopyEcShardsRequest) -> Result<Vec<ShardId>> {
    if req.source == state.url {
        // already local, nothing to transfer
        let bits = state.store.ec_shard_bits(req.volume_id);
        if let Some(missing) = req.shard_ids.iter().find(|id| !bits.has(**id)) {
            return Err(Error::NotFound(format!("ec shard {}.{}", req.volume_id, missing)));
        }
        return Ok(req.shard_ids.clone());
    }

    let fetched = try_join_all(req.shard_ids.iter().map(|&shard_id| async move {
        let data = state
            .peers
            .fetch_ec_shard(&req.source, req.volume_id, shard_id)
            .await?;
        Ok::<_, Error>((shard_id, data))
    }))
    .await?;

    for (shard_id, data) in fetched {
        state
            .store
            .store_ec_shard(req.volume_id, &req.collection, shard_id, data)?;
    }
    tracing::info!(
        volume = %req.volume_id,
        source = %req.source,
        shards = ?req.shard_ids,
        "copied ec shards"
    );
    Ok(req.shard_ids.clone())
}

async fn mount_ec_shards(State(state): State<VolumeState>, Json(req): Json<EcShardsRequest>) -> Response {
    ok_or_error(state.store.mount_ec_shards(req.volume_id, &req.shard_ids))
}

async fn unmount_ec_shards(State(state): State<VolumeState>, Json(req): Json<EcShardsRequest>) -> Response {
    ok_or_error(state.store.unmount_ec_shards(req.volume_id, &req.shard_ids))
}

async fn delete_ec_shards(State(state): State<VolumeState>, Json(req): Json<EcShardsRequest>) -> Response {
    ok_or_error(state.store.delete_ec_shards(req.volume_id, &req.shard_ids))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShardQuery {
    volume_id: VolumeId,
    shard_id: ShardId,
}

async fn read_ec_shard(State(state): State<VolumeState>, Query(query): Query<ShardQuery>) -> Response {
    match state.store.read_ec_shard(query.volume_id, query.shard_id) {
        Ok(data) => {
            let digest = blake3_hash(&data);
            (
                [
                    (header::CONTENT_TYPE.as_str(), "application/octet-stream".to_string()),
                    (SHARD_DIGEST_HEADER, digest),
                ],
                data,
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn status(State(state): State<VolumeState>) -> impl IntoResponse {
    Json(json!({
        "url": state.url,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": METRICS.uptime_seconds(),
        "disk": state.store.disk_info(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Location;
    use crate::volume::store::LocalStore;
    use crate::operation::{LocationDirectory, ReplicaClient, ReplicaUpload};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoDirectory;

    #[async_trait]
    impl LocationDirectory for NoDirectory {
        async fn lookup_volume(&self, _volume_id: VolumeId) -> Result<Vec<Location>> {
            Ok(vec![Location::new("127.0.0.1:8080"), Location::new("127.0.0.1:8081")])
        }
    }

    #[derive(Default)]
    struct CountingClient {
        uploads: AtomicUsize,
    }

    #[async_trait]
    impl ReplicaClient for CountingClient {
        async fn upload(&self, _location: &Location, _upload: &ReplicaUpload) -> Result<()> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, _location: &Location, _fid: &FileId, _jwt: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    fn app() -> (Router, Arc<MemoryStore>, Arc<CountingClient>) {
        let store = Arc::new(MemoryStore::new(8));
        store
            .allocate_volume(VolumeId(3), "", "001".parse().unwrap(), Ttl::default())
            .unwrap();
        let client = Arc::new(CountingClient::default());
        let replication = Arc::new(ReplicationCoordinator::new(
            store.clone(),
            Arc::new(NoDirectory),
            client.clone(),
            "127.0.0.1:8080",
        ));
        let state = VolumeState {
            store: store.clone(),
            replication,
            peers: Arc::new(VolumeServerClient::new(Duration::from_secs(1)).unwrap()),
            url: "127.0.0.1:8080".to_string(),
        };
        (create_router(state, 1024 * 1024), store, client)
    }

    #[tokio::test]
    async fn test_client_write_fans_out_and_replica_write_does_not() {
        let (app, store, client) = app();

        let req = Request::builder()
            .method("PUT")
            .uri("/3,1637037d62f5bd5f3")
            .header("Content-Type", "text/plain")
            .header("Content-Disposition", "inline; filename=\"a.txt\"")
            .header("Seaweed-Owner", "ops")
            .body(Body::from("hello"))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(client.uploads.load(Ordering::SeqCst), 1);

        let needle = store.get_needle(VolumeId(3), 0x01637037d6).unwrap();
        assert_eq!(needle.name, "a.txt");
        assert_eq!(needle.mime, "text/plain");
        assert_eq!(needle.pairs.as_deref(), Some(&br#"{"owner":"ops"}"#[..]));

        let req = Request::builder()
            .method("PUT")
            .uri("/3,2637037d62f5bd5f3?type=replicate&ttl=")
            .body(Body::from("again"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(client.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_and_delete_needle() {
        let (app, store, _client) = app();
        store
            .write_needle(VolumeId(3), &Needle::new(0x01637037d6, 0x2f5bd5f3, b"hi".to_vec()), false)
            .unwrap();

        let req = Request::builder()
            .uri("/3,1637037d62f5bd5f3")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // wrong cookie
        let req = Request::builder()
            .uri("/3,1637037d600000000")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .method("DELETE")
            .uri("/3,1637037d62f5bd5f3?type=replicate")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(store.get_needle(VolumeId(3), 0x01637037d6).is_err());
    }

    #[tokio::test]
    async fn test_read_only_volume_rejects_writes() {
        let (app, store, _client) = app();
        store.set_read_only(VolumeId(3), true).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/3,1637037d62f5bd5f3?type=replicate")
            .body(Body::from("x"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_header_helpers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "BEARER abc".parse().unwrap());
        headers.insert(
            header::CONTENT_DISPOSITION,
            "inline; filename=\"photo.jpg\"".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
        assert_eq!(disposition_filename(&headers), "photo.jpg");
        assert!(pairs_from_headers(&headers).is_none());
    }
}
