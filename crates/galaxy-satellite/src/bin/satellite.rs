//! Satellite process entry point.
//!
//! One binary, one subcommand per process role. Every role takes the same
//! base flags; `ranged-loop` additionally takes the metainfo database URL,
//! whose fragment may select an alternate catalog backend.
//!
//! Exit codes: 0 on a normal stop, 1 when configuration or identity loading
//! fails, 2 when opening or migrating a database fails.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use galaxy_core::SystemClock;
use galaxy_metabase::{Metabase, SqliteAdapter};
use galaxy_overlay::{Config as OverlayConfig, OverlayDb, Service as OverlayService};
use galaxy_satellite::accountfreeze::{
    AccountFreezeChore, AccountFreezeService, FreezeConfig, NoopAnalytics,
};
use galaxy_satellite::audit::AuditObserver;
use galaxy_satellite::gc::GcObserver;
use galaxy_satellite::gracefulexit::queue::TransferQueue;
use galaxy_satellite::gracefulexit::GracefulExitObserver;
use galaxy_satellite::rangedloop::provider::MetabaseSegmentProvider;
use galaxy_satellite::rangedloop::{Config as LoopConfig, Observer, RangedLoopService};
use galaxy_satellite::repair::{CheckerConfig, CheckerObserver, RepairQueue};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "satellite", about = "Galaxy satellite")]
struct Cli {
    /// Directory holding configuration files.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// Directory holding the satellite identity.
    #[arg(long, global = true, default_value = ".")]
    identity_dir: PathBuf,

    /// Satellite database URL (sqlite path).
    #[arg(long, global = true, default_value = "satellite.db")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Public API process.
    Api,
    /// The ranged loop over the segment catalog.
    RangedLoop {
        /// Metainfo database URL; a fragment selects the backend.
        #[arg(long, default_value = "metainfo.db")]
        metainfo_database_url: String,
        /// Run a single iteration and exit.
        #[arg(long)]
        once: bool,
    },
    /// Garbage-collection bloom filter generation.
    GcBloomfilter {
        #[arg(long, default_value = "metainfo.db")]
        metainfo_database_url: String,
    },
    /// Console UI process.
    Ui,
    /// Admin endpoints process.
    Admin,
}

fn db_path(url: &str) -> (String, Option<String>) {
    let trimmed = url.trim_start_matches("sqlite://");
    match trimmed.split_once('#') {
        Some((path, fragment)) => (path.to_string(), Some(fragment.to_string())),
        None => (trimmed.to_string(), None),
    }
}

async fn open_metabase(url: &str) -> Result<Arc<Metabase>, ExitCode> {
    let (path, fragment) = db_path(url);
    if let Some(backend) = &fragment {
        if backend != "sqlite" {
            error!(backend, "unknown metainfo backend requested");
            return Err(ExitCode::from(2));
        }
    }
    match SqliteAdapter::open(&path).await {
        Ok(adapter) => Ok(Arc::new(Metabase::new(vec![Arc::new(adapter)]))),
        Err(err) => {
            error!(error = %err, "opening metainfo database failed");
            Err(ExitCode::from(2))
        }
    }
}

async fn build_loop(
    cli: &Cli,
    metainfo_url: &str,
    observers_for: fn(Arc<OverlayService>, Arc<RepairQueue>, Arc<TransferQueue>) -> Vec<Box<dyn Observer>>,
) -> Result<RangedLoopService, ExitCode> {
    let metabase = open_metabase(metainfo_url).await?;

    let (db_file, _) = db_path(&cli.database_url);
    let overlay_db = match OverlayDb::open(&db_file).await {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(error = %err, "opening satellite database failed");
            return Err(ExitCode::from(2));
        }
    };
    let overlay = Arc::new(OverlayService::new(
        overlay_db,
        OverlayConfig::default(),
        Arc::new(SystemClock),
    ));

    let repair_queue = match RepairQueue::open(format!("{db_file}.repair")).await {
        Ok(queue) => Arc::new(queue),
        Err(err) => {
            error!(error = %err, "opening repair queue failed");
            return Err(ExitCode::from(2));
        }
    };
    let transfer_queue = match TransferQueue::open(format!("{db_file}.transfers")).await {
        Ok(queue) => Arc::new(queue),
        Err(err) => {
            error!(error = %err, "opening transfer queue failed");
            return Err(ExitCode::from(2));
        }
    };

    Ok(RangedLoopService::new(
        Arc::new(MetabaseSegmentProvider::new(metabase)),
        observers_for(overlay, repair_queue, transfer_queue),
        LoopConfig::default(),
    ))
}

fn full_observer_set(
    overlay: Arc<OverlayService>,
    repair_queue: Arc<RepairQueue>,
    transfer_queue: Arc<TransferQueue>,
) -> Vec<Box<dyn Observer>> {
    vec![
        Box::new(CheckerObserver::new(
            repair_queue,
            overlay.clone(),
            CheckerConfig::default(),
            Arc::new(SystemClock),
        )),
        Box::new(AuditObserver::new(64)),
        Box::new(GracefulExitObserver::new(overlay, transfer_queue)),
    ]
}

fn gc_observer_set(
    _overlay: Arc<OverlayService>,
    _repair_queue: Arc<RepairQueue>,
    _transfer_queue: Arc<TransferQueue>,
) -> Vec<Box<dyn Observer>> {
    vec![Box::new(GcObserver::new(0.01))]
}

async fn run() -> ExitCode {
    let cli = Cli::parse();

    if !cli.config_dir.exists() || !cli.identity_dir.exists() {
        error!(
            config_dir = %cli.config_dir.display(),
            identity_dir = %cli.identity_dir.display(),
            "configuration or identity directory missing"
        );
        return ExitCode::from(1);
    }

    match &cli.command {
        Command::Api => {
            let (db_file, _) = db_path(&cli.database_url);
            let freeze_db = match AccountFreezeService::open(format!("{db_file}.console")).await {
                Ok(service) => Arc::new(service),
                Err(err) => {
                    error!(error = %err, "opening console database failed");
                    return ExitCode::from(2);
                }
            };
            let chore = AccountFreezeChore::new(
                freeze_db,
                Arc::new(NoopAnalytics),
                FreezeConfig::default(),
                Arc::new(SystemClock),
            );
            info!("api process running");
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = chore.run_once().await {
                            error!(error = %err, "account freeze tick failed");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("api process stopping");
                        return ExitCode::SUCCESS;
                    }
                }
            }
        }
        Command::RangedLoop {
            metainfo_database_url,
            once,
        } => {
            let mut service = match build_loop(&cli, metainfo_database_url, full_observer_set).await
            {
                Ok(service) => service,
                Err(code) => return code,
            };
            loop {
                if let Err(err) = service.run_once(chrono::Utc::now()).await {
                    error!(error = %err, "ranged loop iteration failed");
                    return ExitCode::from(2);
                }
                if *once {
                    return ExitCode::SUCCESS;
                }
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(600)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("ranged loop stopping");
                        return ExitCode::SUCCESS;
                    }
                }
            }
        }
        Command::GcBloomfilter {
            metainfo_database_url,
        } => {
            let mut service = match build_loop(&cli, metainfo_database_url, gc_observer_set).await {
                Ok(service) => service,
                Err(code) => return code,
            };
            match service.run_once(chrono::Utc::now()).await {
                Ok(()) => {
                    info!("gc bloom filter pass complete");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(error = %err, "gc bloom filter pass failed");
                    ExitCode::from(2)
                }
            }
        }
        Command::Ui => {
            info!("console ui is served by a separate deployment in this build");
            ExitCode::SUCCESS
        }
        Command::Admin => {
            info!("admin endpoints are served by a separate deployment in this build");
            ExitCode::SUCCESS
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    run().await
}
