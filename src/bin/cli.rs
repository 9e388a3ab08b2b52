//! CLI for cluster operations

use clap::{Parser, Subcommand};
use needlefs::common::{parse_duration, ClusterLock, ReplicaPlacement, Ttl, VolumeId};
use needlefs::operation::MasterClient;
use needlefs::ops::{ec_balance, ec_encode, EcCommandEnv, EcEncodeOptions};
use needlefs::volume::client::AllocateVolumeRequest;
use needlefs::volume::VolumeServerClient;
use needlefs::Config;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "needlefs")]
#[command(about = "needlefs cluster administration")]
#[command(version)]
struct Cli {
    /// Master URL
    #[arg(long, global = true, default_value = "http://localhost:9333")]
    master: String,

    /// Per-request timeout in seconds
    #[arg(long, global = true, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Erasure-code full and quiet volumes and spread the shards
    #[command(name = "ec.encode")]
    EcEncode {
        #[arg(long, default_value = "")]
        collection: String,

        /// Encode this volume only
        #[arg(long)]
        volume_id: Option<VolumeId>,

        /// Minimum fullness in percent of the volume size limit
        #[arg(long)]
        full_percent: Option<f64>,

        /// Minimum time without writes, e.g. 1h, 30m
        #[arg(long)]
        quiet_for: Option<String>,

        /// Copy shards to all targets concurrently
        #[arg(long)]
        parallelize: Option<bool>,

        /// Encode even on clusters with few data nodes
        #[arg(long)]
        force: bool,

        /// Replica placement for the shards, e.g. 001
        #[arg(long)]
        shard_replica_placement: Option<ReplicaPlacement>,

        /// Balance encoded volumes afterwards
        #[arg(long)]
        rebalance: bool,
    },

    /// Spread shard sets that still sit on a single server
    #[command(name = "ec.balance")]
    EcBalance {
        /// Comma-separated collections, all when omitted
        #[arg(long, value_delimiter = ',')]
        collection: Vec<String>,

        /// Perform the moves instead of printing the plan
        #[arg(long)]
        apply: bool,

        /// Copy shards to all targets concurrently
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        parallelize: bool,
    },

    /// Create an empty volume on the given servers
    #[command(name = "volume.allocate")]
    VolumeAllocate {
        #[arg(long)]
        volume_id: VolumeId,

        #[arg(long, default_value = "")]
        collection: String,

        /// Replica placement, e.g. 001
        #[arg(long, default_value = "000")]
        replication: ReplicaPlacement,

        #[arg(long, default_value = "")]
        ttl: String,

        /// ip:port of each replica, repeatable
        #[arg(long = "server", required = true)]
        servers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout.max(1));
    let master = Arc::new(MasterClient::new(&cli.master, timeout)?);
    let admin = Arc::new(VolumeServerClient::new(timeout)?);
    let env = EcCommandEnv {
        topology: master.clone(),
        directory: master.clone(),
        admin: admin.clone(),
    };
    let owner = format!("needlefs-cli-{}", uuid::Uuid::new_v4());

    match cli.command {
        Commands::EcEncode {
            collection,
            volume_id,
            full_percent,
            quiet_for,
            parallelize,
            force,
            shard_replica_placement,
            rebalance,
        } => {
            let config = Config::load()?;
            let mut opts = EcEncodeOptions::from_config(&config.ec)?;
            opts.collection = collection;
            opts.volume_id = volume_id;
            opts.force = force;
            opts.shard_replica_placement = shard_replica_placement;
            opts.rebalance = rebalance;
            if let Some(p) = full_percent {
                opts.full_percent = p;
            }
            if let Some(q) = quiet_for {
                opts.quiet_for = parse_duration(&q)?;
            }
            if let Some(p) = parallelize {
                opts.parallelize = p;
            }

            let lock = ClusterLock::acquire(master.clone(), owner).await?;
            let result = ec_encode(&env, &lock, &opts).await;
            lock.release().await?;
            let report = result?;

            if let Some(reason) = &report.skipped {
                println!("ec.encode skipped: {}", reason);
                return Ok(());
            }
            println!("ec.encode report:");
            println!("  Candidates: {:?}", report.candidates);
            println!("  Encoded: {:?}", report.encoded);
            if !report.is_success() {
                anyhow::bail!("ec.encode failed:\n{}", report.failure_summary());
            }
        }

        Commands::EcBalance {
            collection,
            apply,
            parallelize,
        } => {
            let lock = ClusterLock::acquire(master.clone(), owner).await?;
            let result = ec_balance(&env, &lock, &collection, parallelize, apply).await;
            lock.release().await?;
            let report = result?;

            println!("ec.balance report:");
            for v in &report.planned {
                println!("  volume {} ({}) concentrated on {}", v.volume_id, v.collection, v.server);
            }
            if !apply {
                println!("  dry run, pass --apply to move shards");
                return Ok(());
            }
            println!("  Moved: {:?}", report.moved);
            if !report.failures.is_empty() {
                let summary: Vec<String> = report
                    .failures
                    .iter()
                    .map(|(vid, e)| format!("volume {}: {}", vid, e))
                    .collect();
                anyhow::bail!("{} volume(s) failed:\n{}", report.failures.len(), summary.join("\n"));
            }
        }

        Commands::VolumeAllocate {
            volume_id,
            collection,
            replication,
            ttl,
            servers,
        } => {
            let ttl = Ttl::parse(&ttl)?;
            if servers.len() != replication.copy_count() {
                tracing::warn!(
                    "{} servers given for replica placement {} ({} copies)",
                    servers.len(),
                    replication,
                    replication.copy_count()
                );
            }
            let request = AllocateVolumeRequest {
                volume_id,
                collection,
                replication: replication.to_string(),
                ttl: ttl.to_string(),
            };
            for server in &servers {
                admin.allocate_volume(server, &request).await?;
                println!("allocated volume {} on {}", volume_id, server);
            }
        }
    }

    Ok(())
}
