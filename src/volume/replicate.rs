//! Replicated writes and deletes
//!
//! A client write lands on one volume server, which writes locally and then
//! forwards the needle to every other replica of the volume. Forwarded
//! requests carry `type=replicate` and are applied locally only.

use crate::common::metrics::{
    METRICS, DELETE_ON_LOCAL_DISK, DELETE_ON_REPLICAS, WRITE_TO_LOCAL_DISK, WRITE_TO_REPLICAS,
};
use crate::common::{Error, FileId, Location, Needle, Result, VolumeId};
use crate::operation::{distributed_operation, LocationDirectory, ReplicaClient, ReplicaUpload};
use crate::volume::store::LocalStore;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ReplicatedWriteParams {
    pub volume_id: VolumeId,
    pub needle: Needle,
    pub jwt: Option<String>,
    /// Set on forwarded replica requests; they never fan out again.
    pub replicate: bool,
    pub fsync: bool,
    pub content_md5: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReplicatedDeleteParams {
    pub volume_id: VolumeId,
    pub needle: Needle,
    pub jwt: Option<String>,
    pub replicate: bool,
}

pub struct ReplicationCoordinator {
    store: Arc<dyn LocalStore>,
    directory: Arc<dyn LocationDirectory>,
    client: Arc<dyn ReplicaClient>,
    /// This server's `ip:port`, as the directory reports it.
    self_url: String,
}

impl ReplicationCoordinator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        directory: Arc<dyn LocationDirectory>,
        client: Arc<dyn ReplicaClient>,
        self_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            directory,
            client,
            self_url: self_url.into(),
        }
    }

    /// Replica locations other than this server that should receive the
    /// operation. Single-copy volumes never consult the directory.
    pub async fn get_writable_remote_replications(
        &self,
        volume_id: VolumeId,
    ) -> Result<Vec<Location>> {
        let copy_count = self
            .store
            .replica_placement(volume_id)
            .map(|rp| rp.copy_count());
        if copy_count == Some(1) {
            return Ok(Vec::new());
        }

        let locations = self
            .directory
            .lookup_volume(volume_id)
            .await
            .map_err(|e| Error::Lookup {
                volume_id,
                reason: e.to_string(),
            })?;

        if let Some(required) = copy_count {
            if locations.len() < required {
                let err = Error::UnderProvisioned {
                    volume_id,
                    found: locations.len(),
                    required,
                };
                tracing::warn!(volume = %volume_id, "{}", err);
            }
        }

        Ok(locations
            .into_iter()
            .filter(|loc| loc.url != self.self_url)
            .collect())
    }

    /// Write locally, then to every remote replica. Returns whether the
    /// local copy was already identical.
    pub async fn replicated_write(&self, params: ReplicatedWriteParams) -> Result<bool> {
        let ReplicatedWriteParams {
            volume_id,
            needle,
            jwt,
            replicate,
            fsync,
            content_md5,
        } = params;

        let remote_locations = if replicate {
            Vec::new()
        } else {
            self.get_writable_remote_replications(volume_id).await?
        };

        let mut unchanged = false;
        if self.store.has_volume(volume_id) {
            let stage = METRICS.stage(WRITE_TO_LOCAL_DISK).start();
            match self.store.write_needle(volume_id, &needle, fsync) {
                Ok(same) => {
                    stage.finish(true);
                    unchanged = same;
                    METRICS.bytes_written.add(needle.data.len() as u64);
                }
                Err(e) => {
                    stage.finish(false);
                    tracing::error!(volume = %volume_id, "write to local disk: {}", e);
                    return Err(Error::LocalStore {
                        op: "write",
                        volume_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if remote_locations.is_empty() {
            return Ok(unchanged);
        }

        let file_id = FileId::from_needle(volume_id, &needle);
        let upload = Arc::new(ReplicaUpload::new(file_id, &needle, jwt, content_md5));
        let stage = METRICS.stage(WRITE_TO_REPLICAS).start();
        let client = self.client.clone();
        let result = distributed_operation(&remote_locations, move |location| {
            let client = client.clone();
            let upload = upload.clone();
            async move { client.upload(&location, &upload).await }
        })
        .await;

        match result {
            Ok(()) => {
                stage.finish(true);
                Ok(unchanged)
            }
            Err(e) => {
                stage.finish(false);
                let err = Error::ReplicaFanout {
                    op: "write",
                    volume_id,
                    failures: fanout_failures(e),
                };
                tracing::error!(fid = %file_id, "{}", err);
                Err(err)
            }
        }
    }

    /// Delete locally, then on every remote replica. Returns the bytes freed
    /// locally; a remote failure fails the whole call.
    pub async fn replicated_delete(&self, params: ReplicatedDeleteParams) -> Result<u64> {
        let ReplicatedDeleteParams {
            volume_id,
            needle,
            jwt,
            replicate,
        } = params;

        let remote_locations = if replicate {
            Vec::new()
        } else {
            self.get_writable_remote_replications(volume_id).await?
        };

        let mut size = 0;
        if self.store.has_volume(volume_id) {
            let stage = METRICS.stage(DELETE_ON_LOCAL_DISK).start();
            match self.store.delete_needle(volume_id, &needle) {
                Ok(freed) => {
                    stage.finish(true);
                    size = freed;
                }
                Err(e) => {
                    stage.finish(false);
                    tracing::error!(volume = %volume_id, "delete on local disk: {}", e);
                    return Err(Error::LocalStore {
                        op: "delete",
                        volume_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if remote_locations.is_empty() {
            METRICS.bytes_freed.add(size);
            return Ok(size);
        }

        let file_id = FileId::from_needle(volume_id, &needle);
        let stage = METRICS.stage(DELETE_ON_REPLICAS).start();
        let client = self.client.clone();
        let jwt = Arc::new(jwt);
        let result = distributed_operation(&remote_locations, move |location| {
            let client = client.clone();
            let jwt = jwt.clone();
            async move { client.delete(&location, &file_id, jwt.as_deref()).await }
        })
        .await;

        match result {
            Ok(()) => {
                stage.finish(true);
                METRICS.bytes_freed.add(size);
                Ok(size)
            }
            Err(e) => {
                stage.finish(false);
                let err = Error::ReplicaFanout {
                    op: "delete",
                    volume_id,
                    failures: fanout_failures(e),
                };
                tracing::error!(fid = %file_id, "{}", err);
                Err(err)
            }
        }
    }
}

fn fanout_failures(err: Error) -> crate::common::FanoutFailures {
    match err {
        Error::Fanout(failures) => failures,
        other => crate::common::FanoutFailures(vec![(String::new(), other.to_string())]),
    }
}
