//! loghauld - ship Kafka topic partitions into object storage
//!
//! # Usage
//!
//! ```bash
//! # Validate configuration
//! loghauld -c loghaul.yaml validate
//!
//! # Run the shipper
//! loghauld -c loghaul.yaml run
//! ```
//!
//! The binary carries no Kafka client; deployments embed the `loghauld`
//! library and plug their transport in through `SourceFactory`. Standalone,
//! `run` operates in drain mode: staged files recovered from a previous
//! run are re-shipped and the process exits once the staging directory is
//! clean.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loghaul_core::offset::FileOffsetStore;
use loghaul_core::{Clock, ShipperConfig};
use loghauld::{discover_staged_partitions, EmptySourceFactory, PartitionAssignment, Supervisor};

#[derive(Parser)]
#[command(name = "loghauld")]
#[command(version, about = "Kafka-to-object-store log shipper")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "loghaul.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the shipper (default)
    Run,
    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Validate => validate(&cli.config),
        Commands::Run => run(&cli.config).await,
    }
}

fn validate(path: &PathBuf) -> Result<()> {
    let config = ShipperConfig::load(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    println!(
        "configuration ok: group={} topics={:?} remote={}",
        config.group, config.topics, config.remote_uri
    );
    Ok(())
}

async fn run(path: &PathBuf) -> Result<()> {
    let mut config = ShipperConfig::load(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    info!(
        service = %config.service,
        group = %config.group,
        remote = %config.remote_uri,
        "starting"
    );

    // standalone runs have no transport: drain staged files, then exit
    info!("no transport linked into this binary, running in drain mode");
    config.consumer.exit_on_idle = true;
    let config = Arc::new(config);

    let store = loghaul_storage::build_store(&config.remote_uri)
        .await
        .context("cannot open remote store")?;
    let offsets = Arc::new(
        FileOffsetStore::open(&config.local_path.join(".offsets"))
            .context("cannot open offset store")?,
    );

    let mut assignments = Vec::new();
    for topic in &config.topics {
        for kafka_partition in discover_staged_partitions(&config.local_path, topic) {
            assignments.push(PartitionAssignment::new(topic.clone(), kafka_partition));
        }
    }
    info!(partitions = assignments.len(), "discovered staged partitions");

    let grace = Duration::from_secs(config.consumer.shutdown_grace_seconds);
    let supervisor = Supervisor::new(
        config.clone(),
        store,
        offsets,
        Arc::new(EmptySourceFactory),
        Clock::system(),
    )?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut run_task = tokio::spawn(supervisor.run(assignments, shutdown_tx.clone()));

    tokio::select! {
        result = &mut run_task => {
            result.context("supervisor task panicked")??;
            info!("all partitions drained");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(grace, &mut run_task).await {
                Ok(result) => {
                    result.context("supervisor task panicked")??;
                    info!("drain complete");
                }
                Err(_) => {
                    // offsets only advance after successful uploads, so an
                    // abort here cannot lose acknowledged data
                    error!(grace_seconds = grace.as_secs(), "drain exceeded grace period, exiting");
                    run_task.abort();
                }
            }
        }
    }

    Ok(())
}
