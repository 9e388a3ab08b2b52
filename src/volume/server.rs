//! Volume server

use crate::common::{Result, VolumeConfig};
use crate::operation::{Heartbeat, HttpReplicaClient, MasterClient};
use crate::volume::client::VolumeServerClient;
use crate::volume::http::{create_router, VolumeState};
use crate::volume::replicate::ReplicationCoordinator;
use crate::volume::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

pub struct VolumeServer {
    config: VolumeConfig,
}

impl VolumeServer {
    pub fn new(config: VolumeConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        let config = self.config;
        tracing::info!("Starting volume server: {}", config.url);
        tracing::info!("  HTTP API: {}", config.bind_addr);
        tracing::info!("  Master: {}", config.master_url);
        tracing::info!("  Location: {}/{}", config.data_center, config.rack);
        tracing::info!("  Max volumes: {}", config.max_volume_count);

        let store = Arc::new(MemoryStore::new(config.max_volume_count));
        let master = Arc::new(MasterClient::new(&config.master_url, config.request_timeout())?);
        let replication = Arc::new(ReplicationCoordinator::new(
            store.clone(),
            master.clone(),
            Arc::new(HttpReplicaClient::new(config.request_timeout())?),
            config.url.clone(),
        ));

        let state = VolumeState {
            store: store.clone(),
            replication,
            peers: Arc::new(VolumeServerClient::new(config.request_timeout())?),
            url: config.url.clone(),
        };
        let router = create_router(state, config.max_body_bytes);

        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        let http_server = axum::serve(listener, router);
        let heartbeat = heartbeat_loop(store, master, config.clone());

        tracing::info!("✓ Volume server ready");

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = heartbeat => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
            }
        }

        Ok(())
    }
}

fn heartbeat_of(store: &MemoryStore, config: &VolumeConfig) -> Heartbeat {
    let disk = store.disk_info();
    Heartbeat {
        url: config.url.clone(),
        public_url: config.public_url().to_string(),
        data_center: config.data_center.clone(),
        rack: config.rack.clone(),
        max_volume_count: disk.max_volume_count,
        volumes: disk.volume_infos,
        ec_shards: disk.ec_shard_infos,
    }
}

async fn heartbeat_loop(store: Arc<MemoryStore>, master: Arc<MasterClient>, config: VolumeConfig) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
    let mut connected = false;
    loop {
        interval.tick().await;
        match master.send_heartbeat(&heartbeat_of(&store, &config)).await {
            Ok(_) if !connected => {
                tracing::info!(master = %master.base_url(), "registered with master");
                connected = true;
            }
            Ok(_) => {}
            Err(e) => {
                if connected {
                    tracing::warn!(master = %master.base_url(), "heartbeat failed: {}", e);
                }
                connected = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ReplicaPlacement, Ttl, VolumeId};

    #[test]
    fn test_heartbeat_reports_store_contents() {
        let store = MemoryStore::new(4);
        store
            .allocate_volume(VolumeId(1), "pics", ReplicaPlacement::default(), Ttl::default())
            .unwrap();
        let config = VolumeConfig {
            url: "10.0.0.1:8080".into(),
            rack: "r1".into(),
            ..Default::default()
        };
        let hb = heartbeat_of(&store, &config);
        assert_eq!(hb.public_url, "10.0.0.1:8080");
        assert_eq!(hb.rack, "r1");
        assert_eq!(hb.max_volume_count, 4);
        assert_eq!(hb.volumes.len(), 1);
    }
}
