//! Relay for the zk lock/mint bridge.
//!
//! The relay carries every lock on the source chain over to a mint on the destination
//! chain:
//!
//! 1. Wait for a `Locked` log to be `confirmations` blocks deep
//! 2. Compute the Merkle commitment over the event fields
//! 3. Prove it with the external ZoKrates prover
//! 4. Call `mintTokens` with the proof on the destination bridge
//! 5. Wait for the mint to confirm
//!
//! ## Architecture
//!
//! ```text
//!   Source        Relay                     Prover        Destination
//!     |             |                         |                |
//!     |--Locked---->|                         |                |
//!     |             |                         |                |
//!     |    (confirmations, commitment)        |                |
//!     |             |                         |                |
//!     |             |--witness + proof------->|                |
//!     |             |<-------proof.json-------|                |
//!     |             |                         |                |
//!     |             |--mintTokens(proof)---------------------->|
//!     |             |<--------------receipt--------------------|
//!     |             |                         |                |
//! ```

use std::{path::PathBuf, str::FromStr, sync::Arc};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures::future::select_all;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use zkbridge_relay::{
    Config, Coordinator, CoordinatorConfig, CoordinatorMessage, EvmMintSubmitter, JobStore,
    LockWatcher, SourceRpcClient, Stage, StatusServer, StatusState, ZokratesProver,
    commitment::{compute_commitment, split_into_limbs},
    metrics::init_metrics,
};

#[derive(Parser, Debug)]
#[command(name = "zkbridge-relay")]
#[command(about = "Relay lock events to zk-verified mints on the destination chain")]
struct Cli {
    #[arg(long, short, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay until SIGINT or SIGTERM.
    Run,
    /// Print the commitment of a lock event.
    Commitment {
        #[arg(long)]
        encrypted_data: String,
        #[arg(long)]
        block_number: u64,
        #[arg(long)]
        timestamp: u64,
        #[arg(long)]
        nonce_hash: String,
    },
    /// List the persisted job log.
    Jobs {
        /// Only show jobs at this stage.
        #[arg(long)]
        stage: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run => run(Config::load(&cli.config)?).await,
        Command::Commitment {
            encrypted_data,
            block_number,
            timestamp,
            nonce_hash,
        } => print_commitment(&encrypted_data, block_number, timestamp, &nonce_hash),
        Command::Jobs { stage } => list_jobs(&Config::load(&cli.config)?, stage.as_deref()),
    }
}

fn print_commitment(
    encrypted_data: &str,
    block_number: u64,
    timestamp: u64,
    nonce_hash: &str,
) -> anyhow::Result<()> {
    let commitment = compute_commitment(encrypted_data, block_number, timestamp, nonce_hash)?;
    let nonce_limbs = split_into_limbs(nonce_hash)?;

    println!("root:           {}", commitment.root);
    println!("limbs:          {}", commitment.limbs.join(" "));
    println!("decimal limbs:  {}", commitment.limbs_as_decimal().join(" "));
    println!("nonce limbs:    {}", nonce_limbs.join(" "));
    Ok(())
}

fn list_jobs(config: &Config, stage: Option<&str>) -> anyhow::Result<()> {
    let Some(state_dir) = &config.relay.state_dir else {
        bail!("relay.state_dir is not configured, there is no job log");
    };
    let stage = stage
        .map(Stage::from_str)
        .transpose()
        .context("unknown stage")?;

    let store = JobStore::open(state_dir)?;
    for job in store.load_all()? {
        if stage.is_some_and(|stage| stage != job.stage) {
            continue;
        }

        let detail = job
            .failure
            .as_ref()
            .map(|failure| format!("{}: {}", failure.kind, failure.message))
            .or_else(|| job.destination_tx_hash.map(|tx| tx.to_string()))
            .unwrap_or_default();
        println!(
            "{} {:<16} attempts={} {}",
            job.source_tx_hash, job.stage, job.attempts, detail
        );
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        source = %config.source.rpc_url,
        destination = %config.destination.rpc_url,
        "Loaded configuration"
    );

    let metrics = init_metrics().context("failed to install Prometheus recorder")?;

    let store = config
        .relay
        .state_dir
        .as_ref()
        .map(JobStore::open)
        .transpose()?;
    match &store {
        Some(_) => info!(state_dir = ?config.relay.state_dir, "Job log enabled"),
        None => info!("No state_dir configured, jobs are kept in memory only"),
    }

    let source = Arc::new(SourceRpcClient::new(
        config.source.rpc_url.clone(),
        config.source.bridge_address,
    ));
    let submitter = Arc::new(
        EvmMintSubmitter::connect(config.destination.clone(), config.retry.fee_bump_percent)
            .await?,
    );
    let prover = Arc::new(ZokratesProver::new(config.prover.clone()));

    let (coordinator_tx, coordinator_rx) =
        mpsc::channel::<CoordinatorMessage>(config.relay.event_queue_size);

    let coordinator = Coordinator::new(
        CoordinatorConfig::from(&config),
        prover,
        submitter,
        store.clone(),
        coordinator_rx,
    );
    let registry = coordinator.registry();

    let shutdown_token = CancellationToken::new();

    let mut handles = Vec::new();

    // Start coordinator.

    {
        let shutdown_token = shutdown_token.clone();

        handles.push(tokio::spawn(async move {
            coordinator.run(shutdown_token).await;
        }));
    }

    // Start source watcher.

    {
        let watcher = LockWatcher::new(
            source,
            config.source.clone(),
            store.clone(),
            coordinator_tx,
        );
        let shutdown_token = shutdown_token.clone();

        handles.push(tokio::spawn(async move {
            watcher.run(shutdown_token).await;
        }));
    }

    // Start status server.

    if let Some(port) = config.relay.status_port {
        let status_server = StatusServer::new(
            port,
            StatusState {
                registry,
                store,
                metrics: Some(metrics),
            },
        );
        let shutdown_token = shutdown_token.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = status_server.run(shutdown_token).await {
                error!(error = %e, "StatusServer error");
            }
        }));
    }

    info!("All services started, waiting for shutdown signal");

    let mut signals: Vec<_> = [SignalKind::interrupt(), SignalKind::terminate()]
        .into_iter()
        .filter_map(|kind| signal(kind).ok())
        .collect();

    if signals.is_empty() {
        bail!("No shutdown signals could be registered");
    }

    let _ = select_all(signals.iter_mut().map(|s| Box::pin(s.recv()))).await;

    info!("Received shutdown signal, shutting down");

    shutdown_token.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    info!("All services stopped, exiting");

    Ok(())
}
