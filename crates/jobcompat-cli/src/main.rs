use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use jobcompat_core::config::JobCompatConfig;
use jobcompat_core::JobId;
use jobcompat_scheduler::platform::SystemClock;
use jobcompat_scheduler::prober::CapabilityProber;
use jobcompat_scheduler::{
    JobHandler, JobManager, JobOutcome, JobParams, SchedulerError, SimulatedPlatform, Wake,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "jobcompat")]
#[command(about = "Inspect and drive the jobcompat job store")]
struct Cli {
    /// Configuration file (defaults to JOBCOMPAT_CONFIG, then ~/.jobcompat/jobcompat.toml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the backends available on a platform version
    Probe {
        /// Platform version (defaults to the configured one)
        #[arg(long)]
        version: Option<u32>,
    },
    /// List pending job requests
    List {
        #[arg(long)]
        tag: Option<String>,
    },
    /// Cancel pending job requests
    Cancel(CancelArgs),
    /// Repair registrations from the store and run jobs as they come due
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct CancelArgs {
    #[arg(long)]
    id: Option<i32>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    all: bool,
}

/// Handler used by `jobcompat run`: logs each run and reports success.
struct LoggingHandler;

#[async_trait]
impl JobHandler for LoggingHandler {
    async fn run(&self, params: JobParams) -> JobOutcome {
        info!(
            job_id = %params.id(),
            tag = %params.tag(),
            failures = params.failure_count,
            transient = params.transient_extras.is_some(),
            "running job"
        );
        JobOutcome::Success
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobcompat=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > JOBCOMPAT_CONFIG env > ~/.jobcompat/jobcompat.toml
    let config_path = cli.config.or_else(|| std::env::var("JOBCOMPAT_CONFIG").ok());
    let config = JobCompatConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        JobCompatConfig::default()
    });

    match cli.command {
        Command::Probe { version } => probe(&config, version),
        command => with_store(command, &config).await?,
    }
    Ok(())
}

async fn with_store(command: Command, config: &JobCompatConfig) -> anyhow::Result<()> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;

    let sim = SimulatedPlatform::new(Arc::new(SystemClock));
    let (wake_tx, wake_rx) = mpsc::channel(256);
    let manager = JobManager::new(db, &sim.services(), wake_tx.clone(), config)?;

    match command {
        Command::Probe { .. } => {}
        Command::List { tag } => {
            let requests = match tag {
                Some(tag) => manager.all_job_requests_for_tag(&tag)?,
                None => manager.all_job_requests()?,
            };
            for request in requests {
                let line = serde_json::json!({
                    "id": request.id(),
                    "tag": request.tag(),
                    "constraint": request.constraint(),
                    "persisted_extras": request.persisted_extras(),
                    "required_backend": request.required_backend(),
                    "network_type": request.network_type().to_string(),
                    "requires_charging": request.requires_charging(),
                    "requires_device_idle": request.requires_device_idle(),
                });
                println!("{line}");
            }
        }
        Command::Cancel(args) => {
            let cancelled = if let Some(id) = args.id {
                if !manager.cancel(JobId(id))? {
                    return Err(SchedulerError::JobNotFound { id: JobId(id) }.into());
                }
                1
            } else if let Some(tag) = args.tag {
                manager.cancel_all_for_tag(&tag)?
            } else {
                manager.cancel_all()?
            };
            println!("cancelled {cancelled} job(s)");
        }
        Command::Run { seconds } => {
            run(Arc::new(manager), sim, wake_tx, wake_rx, config, seconds).await?;
        }
    }
    Ok(())
}

fn probe(config: &JobCompatConfig, version: Option<u32>) {
    let version = version.unwrap_or(config.platform.version);
    let prober = CapabilityProber::new(config.scheduler.disabled_backends.clone());
    for d in prober.available_backends(version) {
        match serde_json::to_string(&d) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(backend = %d.kind, error = %e, "could not encode descriptor"),
        }
    }
}

async fn run(
    manager: Arc<JobManager>,
    sim: Arc<SimulatedPlatform>,
    wake_tx: mpsc::Sender<Wake>,
    wake_rx: mpsc::Receiver<Wake>,
    config: &JobCompatConfig,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    let tags: BTreeSet<String> = manager
        .all_job_requests()?
        .into_iter()
        .map(|r| r.tag().to_string())
        .collect();
    let handler: Arc<dyn JobHandler> = Arc::new(LoggingHandler);
    for tag in tags {
        manager.register_handler(tag, handler.clone());
    }

    let report = manager.on_boot_or_process_restart()?;
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "some jobs could not be re-registered");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tick = Duration::from_secs(config.scheduler.tick_secs.max(1));
    let platform = tokio::spawn(sim.run(wake_tx, tick, shutdown_rx.clone()));
    let dispatcher = tokio::spawn(manager.run(wake_rx, shutdown_rx));

    match seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(platform, dispatcher);
    Ok(())
}

fn ensure_parent_dir(path: &str) -> jobcompat_core::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
