use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use sequencer_core::{
    setup_logger, EntryStatus, MemoryStore, OutcomeStatus, RegistrationCoordinator,
    RegistrationError, SequencerConfig, SigningKeyRef, SimulatedChain, SqliteStore, Store,
    TxPayload, WalletState,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

const DEFAULT_CONFIG: &str = "config/sequencer.toml";

#[derive(Parser, Debug)]
#[command(author, version, about = "Wallet allocation and transaction sequencing core", long_about = None)]
struct Args {
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// SQLite database path (overrides config and SEQUENCER_DB_PATH)
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive concurrent registrations through the full pipeline against a simulated chain
    Simulate {
        #[arg(short, long, default_value_t = 20)]
        registrations: usize,
        /// Pool size to provision when the pool has fewer wallets
        #[arg(short, long, default_value_t = 5)]
        wallets: usize,
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,
        #[arg(long, default_value_t = 0.0)]
        reject_rate: f64,
        #[arg(long, default_value_t = 0.0)]
        drop_rate: f64,
        /// How long each registration may take to settle
        #[arg(long, default_value_t = 60)]
        settle_secs: u64,
        /// Use the in-memory store instead of SQLite
        #[arg(long)]
        memory: bool,
    },
    /// Print pool, queue and outcome counts from the store
    Status,
    /// Delete all wallet and queue rows, then reseed from the inventory
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Default, Serialize)]
struct StoreStatus {
    wallets_free: usize,
    wallets_leased: usize,
    wallets_retired: usize,
    entries_queued: usize,
    entries_submitted: usize,
    entries_retrying: usize,
    entries_confirmed: usize,
    entries_failed: usize,
    outcomes_pending: usize,
    outcomes_completed: usize,
    outcomes_failed: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    config
        .apply_env_overrides()
        .context("Invalid SEQUENCER_* override")?;
    if let Some(db) = &args.db {
        config.store.path = db.clone();
    }
    config.validate().context("Invalid configuration")?;

    let _log_guard = setup_logger(&config.logging.dir)?;

    match args.command {
        Commands::Simulate {
            registrations,
            wallets,
            latency_ms,
            reject_rate,
            drop_rate,
            settle_secs,
            memory,
        } => {
            let chain = Arc::new(
                SimulatedChain::new()
                    .with_latency(Duration::from_millis(latency_ms))
                    .with_fault_rates(reject_rate, drop_rate),
            );
            let store: Arc<dyn Store> = if memory {
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(open_store(&config.store.path).await?)
            };
            simulate(
                config,
                store,
                chain,
                registrations,
                wallets,
                Duration::from_secs(settle_secs),
            )
            .await
        }
        Commands::Status => {
            let store = open_store(&config.store.path).await?;
            let status = store_status(&store).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            let metrics = store.metrics();
            info!(
                "Store queries: {} ({} errors, {:.2}% error rate)",
                metrics.total_queries,
                metrics.total_errors,
                metrics.error_rate()
            );
            store.close().await;
            Ok(())
        }
        Commands::Purge { yes } => {
            if !yes {
                bail!("Refusing to purge without --yes");
            }
            let store = Arc::new(open_store(&config.store.path).await?);
            let coordinator = RegistrationCoordinator::open(
                config,
                store.clone(),
                Arc::new(SimulatedChain::new()),
            )
            .await?;
            let report = coordinator.purge().await?;
            println!(
                "Purged {} wallets and {} queue entries; pool now holds {} wallets",
                report.wallets,
                report.entries,
                coordinator.pool().stats().await.total
            );
            store.close().await;
            Ok(())
        }
    }
}

fn load_config(path: &str) -> Result<SequencerConfig> {
    let fallback = format!("sequencer-core/{}", DEFAULT_CONFIG);
    let resolved = if Path::new(path).exists() {
        path.to_string()
    } else if path == DEFAULT_CONFIG && Path::new(&fallback).exists() {
        fallback
    } else {
        eprintln!("Config {} not found, using defaults", path);
        return Ok(SequencerConfig::default());
    };
    SequencerConfig::from_path(&resolved)
}

async fn open_store(path: &str) -> Result<SqliteStore> {
    SqliteStore::open(path)
        .await
        .with_context(|| format!("Failed to open store {}", path))
}

async fn store_status(store: &SqliteStore) -> Result<StoreStatus> {
    let mut status = StoreStatus::default();
    for record in store.load_wallets().await? {
        match record.wallet.state {
            WalletState::Free => status.wallets_free += 1,
            WalletState::Leased => status.wallets_leased += 1,
            WalletState::Retired => status.wallets_retired += 1,
        }
    }
    for entry in store.load_entries().await? {
        match entry.status {
            EntryStatus::Queued => status.entries_queued += 1,
            EntryStatus::Submitted => status.entries_submitted += 1,
            EntryStatus::Retrying => status.entries_retrying += 1,
            EntryStatus::Confirmed => status.entries_confirmed += 1,
            EntryStatus::Failed => status.entries_failed += 1,
        }
    }
    for outcome in store.load_outcomes().await? {
        match outcome.status {
            OutcomeStatus::Pending => status.outcomes_pending += 1,
            OutcomeStatus::Completed => status.outcomes_completed += 1,
            OutcomeStatus::Failed => status.outcomes_failed += 1,
        }
    }
    Ok(status)
}

async fn simulate(
    config: SequencerConfig,
    store: Arc<dyn Store>,
    chain: Arc<SimulatedChain>,
    registrations: usize,
    wallets: usize,
    settle: Duration,
) -> Result<()> {
    let backoff = config.pool.acquire_wait();
    let coordinator = Arc::new(RegistrationCoordinator::open(config, store, chain.clone()).await?);

    let existing = coordinator.pool().stats().await.total;
    for i in existing..wallets {
        let address = format!("0x{}", hex::encode(rand::random::<[u8; 20]>()));
        coordinator
            .pool()
            .provision(&address, SigningKeyRef::new(format!("sim-key-{}", i + 1)))
            .await?;
    }

    // Create a cancellation token for graceful shutdown
    let token = CancellationToken::new();
    let cloned_token = token.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C. Initiating graceful shutdown...");
                cloned_token.cancel();
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    let dispatcher = coordinator.dispatcher();
    let dispatch_token = token.clone();
    let dispatch = tokio::spawn(async move { dispatcher.run(dispatch_token).await });

    let start_time = std::time::Instant::now();
    let run_id = Utc::now().timestamp_millis();
    info!(
        "Starting {} registrations over {} wallets...",
        registrations,
        coordinator.pool().stats().await.total
    );

    let mut set = JoinSet::new();
    for i in 0..registrations {
        let coordinator = coordinator.clone();
        let token = token.clone();
        let request_id = format!("sim-{}-{:04}", run_id, i + 1);
        let span = info_span!("registration", request_id = %request_id);

        set.spawn(
            async move {
                let payload = TxPayload::registration(serde_json::json!({ "tourist_id": request_id }));
                loop {
                    match coordinator
                        .request_registration(&request_id, payload.clone())
                        .await
                    {
                        Err(RegistrationError::PoolExhausted { .. }) if !token.is_cancelled() => {
                            tokio::time::sleep(backoff).await;
                        }
                        Err(RegistrationError::Pending { .. }) => break,
                        other => return other,
                    }
                }
                coordinator.await_registration(&request_id, settle).await
            }
            .instrument(span),
        );
    }

    let mut completed = 0;
    let mut failed = 0;
    let mut unresolved = 0;
    while let Some(res) = set.join_next().await {
        match res {
            Ok(Ok(_)) => completed += 1,
            Ok(Err(RegistrationError::Failure { .. })) => failed += 1,
            Ok(Err(e)) => {
                warn!("Registration unresolved: {}", e);
                unresolved += 1;
            }
            Err(e) => {
                error!("A registration task panicked or failed to join: {:?}", e);
                unresolved += 1;
            }
        }
    }

    token.cancel();
    let report = dispatch.await.context("Dispatcher task failed")?;

    let total_duration = start_time.elapsed();
    let rate = if registrations > 0 {
        completed as f64 / registrations as f64 * 100.0
    } else {
        0.0
    };
    println!(
        "Total Time: {:.1}s | Completed: {} | Failed: {} | Unresolved: {} | Success Rate: {:.2}%",
        total_duration.as_secs_f64(),
        completed,
        failed,
        unresolved,
        rate
    );
    println!(
        "Chain: {} submissions, {} confirmations | Dispatcher: {} steps, {} requeued, {} errors",
        chain.submissions().len(),
        chain.confirmations().len(),
        report.steps,
        report.requeued,
        report.errors
    );
    if !report.halted.is_empty() {
        warn!("Halted wallets: {}", report.halted.join(", "));
    }
    println!("{}", coordinator.metrics().to_json());
    Ok(())
}
