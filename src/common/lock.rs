//! Cluster-wide admin lock
//!
//! Placement commands must not run concurrently anywhere in the cluster.
//! [`ClusterLock`] is the capability proving the caller holds the lease:
//! it is acquired once, renewed in the background, and released when it is
//! dropped or explicitly released.

use crate::common::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Where the lease lives (the master, or an in-process table in tests).
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Grant or renew the lease for `owner`. Returns the lease length.
    async fn acquire(&self, owner: &str) -> Result<Duration>;

    async fn release(&self, owner: &str) -> Result<()>;
}

pub struct ClusterLock {
    backend: Arc<dyn LockBackend>,
    owner: String,
    held: Arc<AtomicBool>,
    renewer: Option<JoinHandle<()>>,
}

impl ClusterLock {
    /// Take the lease, failing if someone else holds it.
    pub async fn acquire(backend: Arc<dyn LockBackend>, owner: impl Into<String>) -> Result<Self> {
        let owner = owner.into();
        let lease = backend.acquire(&owner).await?;
        tracing::info!(owner = %owner, ?lease, "acquired cluster lock");

        let held = Arc::new(AtomicBool::new(true));
        let renewer = tokio::spawn(renew_loop(
            backend.clone(),
            owner.clone(),
            held.clone(),
            lease,
        ));

        Ok(Self {
            backend,
            owner,
            held,
            renewer: Some(renewer),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn confirm_is_locked(&self) -> Result<()> {
        if self.is_locked() {
            Ok(())
        } else {
            Err(Error::LockLost)
        }
    }

    pub async fn release(mut self) -> Result<()> {
        self.stop_renewing();
        if self.held.swap(false, Ordering::SeqCst) {
            self.backend.release(&self.owner).await?;
            tracing::info!(owner = %self.owner, "released cluster lock");
        }
        Ok(())
    }

    fn stop_renewing(&mut self) {
        if let Some(handle) = self.renewer.take() {
            handle.abort();
        }
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        self.stop_renewing();
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        let backend = self.backend.clone();
        let owner = std::mem::take(&mut self.owner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = backend.release(&owner).await {
                    tracing::warn!(owner = %owner, "release cluster lock: {}", e);
                }
            });
        }
    }
}

async fn renew_loop(
    backend: Arc<dyn LockBackend>,
    owner: String,
    held: Arc<AtomicBool>,
    mut lease: Duration,
) {
    loop {
        tokio::time::sleep((lease / 3).max(Duration::from_millis(10))).await;
        match backend.acquire(&owner).await {
            Ok(next) => lease = next,
            Err(e) => {
                tracing::error!(owner = %owner, "renew cluster lock: {}", e);
                held.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}
