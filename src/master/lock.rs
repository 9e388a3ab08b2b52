//! The master side of the cluster admin lock: one holder, leased.

use crate::common::{Error, LockBackend, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Lease {
    owner: String,
    expires: Instant,
}

#[derive(Debug)]
pub struct LockTable {
    ttl: Duration,
    lease: Mutex<Option<Lease>>,
}

impl LockTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            lease: Mutex::new(None),
        }
    }

    pub fn holder(&self) -> Option<String> {
        let lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        lease
            .as_ref()
            .filter(|l| l.expires > Instant::now())
            .map(|l| l.owner.clone())
    }
}

#[async_trait]
impl LockBackend for LockTable {
    async fn acquire(&self, owner: &str) -> Result<Duration> {
        let mut lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(current) = lease.as_ref() {
            if current.owner != owner && current.expires > now {
                return Err(Error::LockHeld(current.owner.clone()));
            }
        }
        if lease.as_ref().map(|l| l.owner.as_str()) != Some(owner) {
            tracing::info!(owner, "cluster lock granted");
        }
        *lease = Some(Lease {
            owner: owner.to_string(),
            expires: now + self.ttl,
        });
        Ok(self.ttl)
    }

    async fn release(&self, owner: &str) -> Result<()> {
        let mut lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        if lease.as_ref().is_some_and(|l| l.owner == owner) {
            *lease = None;
            tracing::info!(owner, "cluster lock released");
        }
        Ok(())
    }
}
