//! Shop Sync Server
//!
//! Receives provider webhooks and runs the reconciliation sweep.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use shop_sync::apply::ApplyContext;
use shop_sync::audit::{AuditLog, JsonlAuditLog};
use shop_sync::config::SyncConfig;
use shop_sync::error::SyncError;
use shop_sync::handlers::ServiceStats;
use shop_sync::model::SyncWindow;
use shop_sync::provider::HttpProviderClient;
use shop_sync::store::{SnapshotOwner, SnapshotStore};
use shop_sync::sweep::SweepJob;
use shop_sync::sync_state::{FileSyncStateStore, SyncStateStore};
use shop_sync::{metrics, server};

/// Shop Sync Server
#[derive(Parser, Debug)]
#[command(name = "shop-sync")]
#[command(version)]
#[command(about = "Webhook ingestion and reconciliation sweep for shop bookings and payments")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for the datastore snapshot, audit log and sync state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve webhooks and operator endpoints, sweeping periodically
    Serve {
        /// Address to bind to
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Seconds between sweeps; 0 disables the periodic sweep
        #[arg(long, default_value = "900")]
        sweep_interval_secs: u64,
    },

    /// Run one reconciliation sweep and print the result
    Sync {
        /// Window start (RFC 3339); defaults to last success minus lookback
        #[arg(long, requires = "end")]
        start: Option<DateTime<Utc>>,

        /// Window end (RFC 3339); defaults to now plus lookahead
        #[arg(long, requires = "start")]
        end: Option<DateTime<Utc>>,
    },

    /// Print the persisted sync state
    Status,

    /// Print the most recent audit entries
    Audit {
        /// Entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Everything the subcommands share
struct Runtime {
    config: SyncConfig,
    store: Arc<SnapshotStore>,
    ctx: ApplyContext,
    audit: Arc<JsonlAuditLog>,
    sync_state: Arc<FileSyncStateStore>,
}

impl Runtime {
    async fn open(config: SyncConfig) -> Result<Self> {
        tokio::fs::create_dir_all(config.state_dir())
            .await
            .with_context(|| format!("creating {}", config.state_dir().display()))?;

        let store = Arc::new(
            SnapshotStore::open(config.store_path())
                .await
                .context("loading datastore snapshot")?,
        );
        let audit = Arc::new(JsonlAuditLog::new(config.audit_path()));
        let ctx = ApplyContext::new(store.clone(), audit.clone());
        let sync_state = Arc::new(FileSyncStateStore::new(
            config.state_dir(),
            config.sweep.lock_ttl,
        ));

        Ok(Self {
            config,
            store,
            ctx,
            audit,
            sync_state,
        })
    }

    fn sweep_job(&self) -> Result<SweepJob> {
        let provider = HttpProviderClient::new(&self.config.provider)
            .context("building provider client")?;
        Ok(SweepJob::new(
            Arc::new(provider),
            self.ctx.clone(),
            self.sync_state.clone(),
            self.config.sweep.clone(),
        ))
    }

    async fn flush(&self) -> Result<()> {
        self.store
            .flush()
            .await
            .context("saving datastore snapshot")
    }
}

/// Claim the datastore snapshot for this process before loading it
async fn claim(config: &SyncConfig) -> Result<SnapshotOwner> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    SnapshotOwner::acquire(&config.store_path())
        .await
        .context("claiming the data directory")
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose {
        "shop_sync=debug,tower_http=debug"
    } else {
        "shop_sync=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    metrics::init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "shop-sync failed");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = SyncConfig::from_env().context("reading configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    match args.command {
        Command::Serve {
            bind,
            sweep_interval_secs,
        } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            serve(config, sweep_interval_secs).await
        }
        Command::Sync { start, end } => {
            let window = start.zip(end).map(|(start, end)| SyncWindow::new(start, end));
            sync_once(config, window).await
        }
        Command::Status => {
            let rt = Runtime::open(config).await?;
            let snapshot = rt.sync_state.get().await.context("reading sync state")?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Audit { limit } => {
            let rt = Runtime::open(config).await?;
            for entry in rt.audit.recent(limit).await.context("reading audit log")? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(config: SyncConfig, sweep_interval_secs: u64) -> Result<ExitCode> {
    let _owner = claim(&config).await?;
    let rt = Runtime::open(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if rt.config.webhook.secret.is_none() {
        tracing::warn!("SHOP_SYNC_WEBHOOK_SECRET is not set; webhooks will be refused");
    }

    let sweeper = if sweep_interval_secs > 0 {
        match rt.sweep_job() {
            Ok(job) => {
                let job = Arc::new(job.with_shutdown(shutdown_rx.clone()));
                Some(tokio::spawn(job.run_periodic(
                    Duration::from_secs(sweep_interval_secs),
                    shutdown_rx.clone(),
                )))
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "Periodic sweep disabled");
                None
            }
        }
    } else {
        None
    };

    let router = server::build_router(
        &rt.config.webhook,
        rt.ctx.clone(),
        rt.sync_state.clone(),
        Arc::new(ServiceStats::new()),
    );
    let listener = tokio::net::TcpListener::bind(rt.config.bind_addr)
        .await
        .with_context(|| format!("binding {}", rt.config.bind_addr))?;

    tracing::info!(
        version = shop_sync::VERSION,
        addr = %rt.config.bind_addr,
        "shop-sync starting"
    );

    let mut shutdown_wait = shutdown_rx.clone();
    let http = server::serve(listener, router, async move {
        let _ = shutdown_wait.wait_for(|stop| *stop).await;
    });
    tokio::pin!(http);

    tokio::select! {
        result = &mut http => result.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
            http.await.context("HTTP server failed")?;
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Sweep task ended abnormally");
        }
    }

    rt.flush().await?;
    tracing::info!("shop-sync stopped");
    Ok(ExitCode::SUCCESS)
}

async fn sync_once(config: SyncConfig, window: Option<SyncWindow>) -> Result<ExitCode> {
    // Refuse while a running server owns the snapshot
    let _owner = match claim(&config).await {
        Ok(owner) => owner,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "Data directory is owned by another process");
            return Ok(ExitCode::from(2));
        }
    };
    let rt = Runtime::open(config).await?;
    let job = rt.sweep_job()?;

    let outcome = job.run(window).await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(SyncError::AlreadyRunning) => {
            tracing::warn!("Another sweep holds the lock");
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e).context("sweep aborted"),
    }
}
