//! Master binary

use clap::{Parser, Subcommand};
use needlefs::{common::MasterConfig, Config, Master};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "needlefs-master")]
#[command(about = "needlefs master: volume directory and admin lock")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the master
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Volume size limit in MB
        #[arg(long)]
        volume_size_limit_mb: Option<u64>,

        /// Seconds without heartbeat before a node is dropped
        #[arg(long)]
        node_timeout: Option<u64>,

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
            volume_size_limit_mb,
            node_timeout,
            config,
        } => {
            // File and environment first, command line flags on top
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

            let mut master_config: MasterConfig = file_config.master.unwrap_or_default();
            if let Some(bind) = bind {
                master_config.bind_addr = bind;
            }
            if let Some(limit) = volume_size_limit_mb {
                master_config.volume_size_limit_mb = limit;
            }
            if let Some(timeout) = node_timeout {
                master_config.node_timeout_secs = timeout;
            }

            Master::new(master_config).serve().await?;
        }
    }

    Ok(())
}
