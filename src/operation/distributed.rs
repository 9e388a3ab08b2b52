//! Fan-out of one operation to many volume servers
//!
//! Every distinct location url is attempted exactly once, concurrently, and the call only
//! returns after all of them have reported. A failure never cancels the
//! others; timeouts belong to the transport, and show up here as ordinary
//! per-location errors.

use crate::common::{Error, FanoutFailures, Location, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use tokio::sync::mpsc;

/// Outcome of one fan-out batch, keyed by location url.
#[derive(Debug, Default)]
pub struct DistributedOperationResult(BTreeMap<String, Option<Error>>);

impl DistributedOperationResult {
    pub fn insert(&mut self, location: String, result: Result<()>) {
        self.0.insert(location, result.err());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.0
            .iter()
            .filter_map(|(loc, err)| err.as_ref().map(|e| (loc.as_str(), e)))
    }

    /// `Ok` iff every location succeeded, otherwise one `[location]: error`
    /// line per failure.
    pub fn into_result(self) -> Result<()> {
        let failures: Vec<(String, String)> = self
            .0
            .into_iter()
            .filter_map(|(loc, err)| err.map(|e| (loc, e.to_string())))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Fanout(FanoutFailures(failures)))
        }
    }
}

/// Run `op` against every location and collect the results. A url listed
/// more than once is only called once.
///
/// `op` is called on the caller's task to build each future; the futures
/// themselves run as independent tokio tasks.
pub async fn distributed_operation_results<F, Fut>(
    locations: &[Location],
    op: F,
) -> DistributedOperationResult
where
    F: Fn(Location) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut seen = BTreeSet::new();
    let locations: Vec<&Location> = locations
        .iter()
        .filter(|location| {
            let first = seen.insert(location.url.as_str());
            if !first {
                tracing::debug!("skip duplicate location {}", location.url);
            }
            first
        })
        .collect();

    let length = locations.len();
    let mut results = DistributedOperationResult::default();
    if length == 0 {
        return results;
    }

    let (tx, mut rx) = mpsc::channel::<(String, Result<()>)>(length);
    for &location in &locations {
        let url = location.url.clone();
        let fut = op(location.clone());
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = fut.await;
            let _ = tx.send((url, result)).await;
        });
    }
    drop(tx);

    let mut received = 0;
    while received < length {
        match rx.recv().await {
            Some((url, result)) => {
                results.insert(url, result);
                received += 1;
            }
            // every sender is gone: some task died before reporting
            None => break,
        }
    }

    if received < length {
        for location in &locations {
            if !results.0.contains_key(&location.url) {
                results.insert(
                    location.url.clone(),
                    Err(Error::Internal("operation aborted before completion".into())),
                );
            }
        }
    }

    results
}

/// [`distributed_operation_results`] folded into one aggregate error.
pub async fn distributed_operation<F, Fut>(locations: &[Location], op: F) -> Result<()>
where
    F: Fn(Location) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    distributed_operation_results(locations, op)
        .await
        .into_result()
}
