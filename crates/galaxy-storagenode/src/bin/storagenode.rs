//! Storage node process entry point.
//!
//! Generates or loads the node identity, opens the piece backend, and
//! serves the piecestore gRPC endpoint until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use galaxy_core::id::{IdVersion, NodeIdentity};
use galaxy_proto::piecestore::piecestore_server::PiecestoreServer;
use galaxy_storagenode::{
    BloomFilterManager, CompactionChore, CompactionConfig, Config, Endpoint, HashStoreBackend,
    PiecestoreService, RestoreTimeManager, SpaceMonitor, TrustedSatellites,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "storagenode", about = "Galaxy storage node")]
struct Cli {
    /// Directory holding configuration files.
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Directory holding the node identity.
    #[arg(long, default_value = ".")]
    identity_dir: PathBuf,

    /// Directory for piece storage.
    #[arg(long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Listen address for the piecestore endpoint.
    #[arg(long, default_value = "0.0.0.0:7777")]
    listen: String,

    /// Allocated disk space in bytes.
    #[arg(long, default_value_t = 1 << 40)]
    allocated_disk: u64,
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

    let identity = Arc::new(NodeIdentity::generate(IdVersion::V0));
    info!(node = %identity.id, "node identity ready");

    let backend = Arc::new(HashStoreBackend::new(
        cli.storage_dir.join("pieces"),
        Arc::new(BloomFilterManager::default()),
        Arc::new(RestoreTimeManager::default()),
    ));
    let monitor = SpaceMonitor::new(cli.allocated_disk, backend.clone());

    // trusted satellites come from configuration in a full deployment; the
    // empty set refuses all traffic until configured
    let trust = Arc::new(TrustedSatellites::default());

    let endpoint = Arc::new(Endpoint::new(
        identity,
        backend.clone(),
        trust,
        monitor,
        Config::default(),
    ));

    let addr = match cli.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, listen = cli.listen, "invalid listen address");
            return ExitCode::from(1);
        }
    };

    let (chore_shutdown, chore_signal) = tokio::sync::oneshot::channel();
    let chore = CompactionChore::new(backend, CompactionConfig::default());
    let chore_handle = tokio::spawn(chore.run(chore_signal));

    info!(listen = %addr, "piecestore endpoint serving");
    let server = tonic::transport::Server::builder()
        .add_service(PiecestoreServer::new(PiecestoreService::new(endpoint)))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("storage node stopping");
        });

    let result = server.await;
    let _ = chore_shutdown.send(());
    let _ = chore_handle.await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "piecestore server failed");
            ExitCode::from(2)
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
