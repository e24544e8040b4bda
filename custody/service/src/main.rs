// Copyright (c) 2024 The Botho Foundation

//! Custody node CLI
//!
//! `run` supervises the workers of one chain; each worker is this same
//! binary started with the hidden `worker` subcommand and its identity in
//! the environment.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::{ffi::OsString, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::broadcast,
};
use tracing::{info, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use custody_core::{
    events::decode_batch, roles::GRACEFUL_EXIT_CODE, ChainId, ChainSettings, CustodyConfig,
    WorkerEnv, WorkerRole,
};
use custody_service::{
    adapter::ChainAdapter,
    db::Database,
    detector::LtDepositDetector,
    executor::WithdrawalExecutor,
    gateway::GatewayAdapter,
    log::SequencedLog,
    observer::LogObserver,
    processor::{BlockProcessor, Reconciler},
    producer::BlockScanProducer,
    queue::{block_queue_name, DurableQueue, SqliteQueue},
    supervisor::{ExeLauncher, ProcessSupervisor},
    tokens::RpcTokenRegistry,
    worker::{ShutdownSignal, WorkerScheduler},
};

#[derive(Parser)]
#[command(name = "custody-node")]
#[command(about = "Multi-chain custody settlement workers")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "custody.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the workers of one chain
    Run {
        /// Chain to settle (SOL or TON)
        #[arg(long)]
        chain: ChainId,

        /// Also run a log observer
        #[arg(long)]
        observer: bool,
    },

    /// Run a single worker (identity from the environment)
    #[command(hide = true)]
    Worker,

    /// Run database migrations only
    Migrate,

    /// Show queue, cursor and settlement status
    Status {
        #[arg(long)]
        chain: ChainId,
    },

    /// Print log batches
    Replay {
        /// First batch index to print
        #[arg(long, default_value = "0")]
        after: u64,

        /// Maximum number of batches
        #[arg(long, default_value = "20")]
        limit: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = CustodyConfig::from_file(&cli.config.to_string_lossy())
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    match cli.command {
        Commands::Run { chain, observer } => run_supervisor(&cli, &config, chain, observer).await,
        Commands::Worker => run_worker(&config).await,
        Commands::Migrate => {
            open_database(&config)?;
            info!("Database migration complete");
            Ok(())
        }
        Commands::Status { chain } => show_status(&config, chain).await,
        Commands::Replay { after, limit } => replay(&config, after, limit).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn open_database(config: &CustodyConfig) -> Result<Database> {
    config.validate_service()?;
    info!("Opening database at {}", config.service.db_path);
    let db = Database::open(&config.service.db_path)?;
    db.migrate()?;
    Ok(db)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn run_supervisor(
    cli: &Cli,
    config: &CustodyConfig,
    chain: ChainId,
    observer: bool,
) -> Result<()> {
    let settings = config.validate_chain(chain)?;
    open_database(config)?;

    let mut roles = WorkerRole::for_scan_mode(settings.scan_mode);
    if observer {
        roles.push(WorkerRole::LogObserver);
    }
    let workers: Vec<WorkerEnv> = roles
        .into_iter()
        .enumerate()
        .map(|(i, role)| WorkerEnv {
            id: i as u32 + 1,
            role,
            chain: role.is_chain_bound().then_some(chain),
        })
        .collect();

    info!("Custody node starting for {}", chain);
    for worker in &workers {
        info!("  worker {}", worker);
    }

    let launcher = ExeLauncher::current_exe(vec![
        OsString::from("--config"),
        cli.config.clone().into_os_string(),
        OsString::from("--log-level"),
        OsString::from(&cli.log_level),
        OsString::from("worker"),
    ])
    .context("Failed to locate worker executable")?;

    let supervisor = ProcessSupervisor::new(Arc::new(launcher), Arc::new(config.service.backoff));
    let report = supervisor.run(workers, shutdown_signal()).await;
    info!(
        "Custody node stopped ({} launches, {} restarts)",
        report.launched, report.restarts
    );
    Ok(())
}

async fn run_worker(config: &CustodyConfig) -> Result<()> {
    let env = WorkerEnv::from_env()?;
    let span = tracing::info_span!("worker", id = env.id, role = %env.role, chain = ?env.chain);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    run_role(config, &env, shutdown_rx).instrument(span).await?;

    info!(worker = %env, "Worker shut down");
    std::process::exit(GRACEFUL_EXIT_CODE);
}

/// Adapter and settings for a chain-bound worker.
fn chain_context<'a>(
    config: &'a CustodyConfig,
    env: &WorkerEnv,
) -> Result<(&'a ChainSettings, Arc<dyn ChainAdapter>)> {
    let chain = env
        .chain
        .ok_or_else(|| anyhow!("{} requires a chain", env.role))?;
    let settings = config.validate_chain(chain)?;
    let adapter: Arc<dyn ChainAdapter> = Arc::new(GatewayAdapter::from_settings(chain, settings)?);
    Ok((settings, adapter))
}

async fn run_role(config: &CustodyConfig, env: &WorkerEnv, shutdown: ShutdownSignal) -> Result<()> {
    let db = open_database(config)?;
    let log = SequencedLog::sqlite(db.clone(), &config.service.log_name);
    let scheduler = WorkerScheduler::new(config.service.alert_after_failures);

    if env.role == WorkerRole::LogObserver {
        let observer = LogObserver::new(db, log, &config.service.log_name)?;
        scheduler.run(observer, shutdown).await?;
        return Ok(());
    }

    let (settings, adapter) = chain_context(config, env)?;
    let chain = adapter.chain();
    match adapter.derive_vault_address().await {
        Ok(vault) => info!(%chain, %vault, "Vault resolved"),
        Err(e) => warn!(%chain, "Vault address not available yet: {}", e),
    }

    let queue: Arc<dyn DurableQueue> = Arc::new(
        SqliteQueue::new(db.clone(), block_queue_name(&config.service.queue_prefix, chain))
            .with_visibility_timeout(Duration::from_millis(
                config.service.queue_visibility_timeout_ms,
            )),
    );

    match env.role {
        WorkerRole::BlockFetcher => {
            let producer = BlockScanProducer::new(adapter, queue, db, settings.scan_interval())?;
            scheduler.run(producer, shutdown).await?;
        }
        WorkerRole::BlockProcessor => {
            let tokens = Arc::new(RpcTokenRegistry::new(&config.service.token_rpc_url)?);
            let reconciler = Reconciler::new(adapter, tokens, db, log);
            let processor = BlockProcessor::new(reconciler, queue, settings.unswept_interval());
            scheduler.run(processor, shutdown).await?;
        }
        WorkerRole::DepositDetector => {
            let tokens = Arc::new(RpcTokenRegistry::new(&config.service.token_rpc_url)?);
            let detector = LtDepositDetector::new(
                adapter,
                tokens,
                db,
                log,
                settings.scan_interval(),
                settings.detect_limit,
            );
            scheduler.run(detector, shutdown).await?;
        }
        WorkerRole::WithdrawExecutor => {
            let executor = WithdrawalExecutor::new(adapter, db, log, settings.withdraw_interval());
            scheduler.run(executor, shutdown).await?;
        }
        WorkerRole::LogObserver => return Err(anyhow!("{} is not chain bound", env.role)),
    }
    Ok(())
}

async fn show_status(config: &CustodyConfig, chain: ChainId) -> Result<()> {
    let db = open_database(config)?;
    let queue = SqliteQueue::new(db.clone(), block_queue_name(&config.service.queue_prefix, chain));
    let log = SequencedLog::sqlite(db.clone(), &config.service.log_name);

    println!("Custody Status ({})", chain);
    println!("===============");
    println!("Queue {}: {} pending", queue.name(), queue.length().await?);
    println!("Unswept deposits: {}", db.count_unswept(chain)?);
    println!("Pending withdrawals: {}", db.count_pending_withdrawals(chain)?);
    println!("Log batches: {}", log.last_finalized().await?);
    println!();
    println!("Cursors:");
    for cursor in db.list_cursors()? {
        println!("  {:<24} {}", cursor.key.to_string(), cursor.position);
    }

    Ok(())
}

async fn replay(config: &CustodyConfig, after: u64, limit: u64) -> Result<()> {
    let db = open_database(config)?;
    let log = SequencedLog::sqlite(db, &config.service.log_name);

    let tail = log.last_finalized().await?;
    let count = limit.min(tail.saturating_sub(after));
    let mut batches = log.batches(after).take(count as usize);

    while let Some(batch) = batches.next().await {
        let (raw, next) = batch?;
        println!("#{}", next - 1);
        for event in decode_batch(&raw)? {
            match event {
                Ok(event) => println!("  {} {}", event.kind(), serde_json::to_string(&event)?),
                Err(e) => println!("  <undecodable> {}", e),
            }
        }
    }

    Ok(())
}
