//! Volume server binary

use clap::{Parser, Subcommand};
use needlefs::{common::VolumeConfig, Config, VolumeServer};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "needlefs-volume")]
#[command(about = "needlefs volume server: stores needles and ec shards")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the volume server
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Advertised ip:port of this server
        #[arg(long)]
        url: Option<String>,

        /// Public ip:port handed to clients
        #[arg(long)]
        public_url: Option<String>,

        /// Master base URL
        #[arg(long)]
        master: Option<String>,

        #[arg(long)]
        data_center: Option<String>,

        #[arg(long)]
        rack: Option<String>,

        /// Volume slots on this server
        #[arg(long)]
        max_volumes: Option<u64>,

        /// Config file (defaults to ./needlefs.toml when present)
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            url,
            public_url,
            master,
            data_center,
            rack,
            max_volumes,
            config,
        } => {
            let file_config = match config {
                Some(path) => Config::load_from(&path)?,
                None => Config::load()?,
            };

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| file_config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let mut volume_config: VolumeConfig = file_config.volume.unwrap_or_default();
            if let Some(bind) = bind {
                volume_config.bind_addr = bind;
            }
            if let Some(url) = url {
                volume_config.url = url;
            }
            if let Some(public_url) = public_url {
                volume_config.public_url = public_url;
            }
            if let Some(master) = master {
                volume_config.master_url = master;
            }
            if let Some(dc) = data_center {
                volume_config.data_center = dc;
            }
            if let Some(rack) = rack {
                volume_config.rack = rack;
            }
            if let Some(max) = max_volumes {
                volume_config.max_volume_count = max;
            }

            VolumeServer::new(volume_config).serve().await?;
        }
    }

    Ok(())
}
