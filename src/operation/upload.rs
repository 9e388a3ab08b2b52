//! Forwarding needle writes and deletes to replica volume servers

use crate::common::metrics::{METRICS, UNMARSHAL_PAIRS};
use crate::common::{FileId, Location, Needle, Result, Ttl};
use crate::operation::{check_response, http_base};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use std::collections::BTreeMap;
use std::time::Duration;

/// Query marker telling the receiver not to fan out again.
pub const REPLICATE_TYPE: &str = "replicate";

/// One needle as sent to every replica of its volume.
#[derive(Debug, Clone)]
pub struct ReplicaUpload {
    pub file_id: FileId,
    pub name: String,
    pub mime: String,
    pub body: Bytes,
    pub is_compressed: bool,
    pub is_chunk_manifest: bool,
    pub last_modified: u64,
    pub ttl: Ttl,
    pub jwt: Option<String>,
    pub content_md5: Option<String>,
    /// Already carrying the `Seaweed-` prefix.
    pub pairs: BTreeMap<String, String>,
}

impl ReplicaUpload {
    /// Malformed pair metadata is dropped with a warning; the needle still goes out.
    pub fn new(
        file_id: FileId,
        needle: &Needle,
        jwt: Option<String>,
        content_md5: Option<String>,
    ) -> Self {
        let pairs = match needle.prefixed_pairs() {
            Ok(pairs) => pairs,
            Err(e) => {
                METRICS.stage(UNMARSHAL_PAIRS).errors.inc();
                tracing::warn!(fid = %file_id, "{}", e);
                BTreeMap::new()
            }
        };
        Self {
            file_id,
            name: needle.name.clone(),
            mime: needle.mime.clone(),
            body: Bytes::copy_from_slice(&needle.data),
            is_compressed: needle.is_compressed,
            is_chunk_manifest: needle.is_chunk_manifest,
            last_modified: needle.last_modified,
            ttl: needle.ttl.clone(),
            jwt,
            content_md5,
            pairs,
        }
    }

    pub fn url(&self, location: &Location) -> Result<Url> {
        let mut url = replica_url(location, &self.file_id)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("type", REPLICATE_TYPE);
            query.append_pair("ttl", &self.ttl.to_string());
            if self.last_modified > 0 {
                query.append_pair("ts", &self.last_modified.to_string());
            }
            if self.is_chunk_manifest {
                query.append_pair("cm", "true");
            }
        }
        Ok(url)
    }
}

fn replica_url(location: &Location, file_id: &FileId) -> Result<Url> {
    let raw = format!("{}/{}", http_base(&location.url), file_id);
    Url::parse(&raw).map_err(|e| crate::Error::Http(format!("bad url {}: {}", raw, e)))
}

/// The wire protocol between volume servers for replica traffic.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    async fn upload(&self, location: &Location, upload: &ReplicaUpload) -> Result<()>;

    async fn delete(&self, location: &Location, file_id: &FileId, jwt: Option<&str>) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpReplicaClient {
    http: reqwest::Client,
}

impl HttpReplicaClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ReplicaClient for HttpReplicaClient {
    async fn upload(&self, location: &Location, upload: &ReplicaUpload) -> Result<()> {
        let mut req = self.http.put(upload.url(location)?).body(upload.body.clone());
        if !upload.mime.is_empty() {
            req = req.header(CONTENT_TYPE, &upload.mime);
        }
        if !upload.name.is_empty() {
            req = req.header(
                CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", upload.name),
            );
        }
        if upload.is_compressed {
            req = req.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(jwt) = upload.jwt.as_deref().filter(|j| !j.is_empty()) {
            req = req.header(AUTHORIZATION, format!("BEARER {}", jwt));
        }
        if let Some(md5) = upload.content_md5.as_deref().filter(|m| !m.is_empty()) {
            req = req.header("Content-MD5", md5);
        }
        for (name, value) in &upload.pairs {
            req = req.header(name.as_str(), value.as_str());
        }

        check_response(req.send().await?).await?;
        Ok(())
    }

    async fn delete(&self, location: &Location, file_id: &FileId, jwt: Option<&str>) -> Result<()> {
        let mut url = replica_url(location, file_id)?;
        url.query_pairs_mut().append_pair("type", REPLICATE_TYPE);

        let mut req = self.http.delete(url);
        if let Some(jwt) = jwt.filter(|j| !j.is_empty()) {
            req = req.header(AUTHORIZATION, format!("BEARER {}", jwt));
        }
        let resp = req.send().await?;
        // already gone on the replica counts as deleted
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(resp).await?;
        Ok(())
    }
}
