//! Master server

use crate::common::{format_bytes, MasterConfig, Result};
use crate::master::http::{create_router, MasterState};
use crate::master::lock::LockTable;
use crate::master::topology::Topology;
use std::sync::Arc;
use std::time::Duration;

pub struct Master {
    config: MasterConfig,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting master");
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!(
            "  Volume size limit: {}",
            format_bytes(self.config.volume_size_limit_mb * 1024 * 1024)
        );
        tracing::info!("  Node timeout: {}s", self.config.node_timeout_secs);

        let node_timeout = Duration::from_secs(self.config.node_timeout_secs.max(1));
        let topology = Arc::new(Topology::new(self.config.volume_size_limit_mb, node_timeout));
        let locks = Arc::new(LockTable::new(Duration::from_secs(
            self.config.lock_ttl_secs.max(1),
        )));

        let pruner = {
            let topology = topology.clone();
            async move {
                let mut interval = tokio::time::interval(node_timeout);
                loop {
                    interval.tick().await;
                    topology.prune_dead();
                }
            }
        };

        let router = create_router(MasterState { topology, locks });
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let http_server = axum::serve(listener, router);

        tracing::info!("✓ Master ready");

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = pruner => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
            }
        }

        Ok(())
    }
}
