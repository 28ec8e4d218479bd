//! Compaction chore.
//!
//! Periodically sweeps every open satellite database and compacts the ones
//! whose hash table load crossed the threshold. Compaction is where expired
//! pieces, deletions, and retain-filter decisions actually reclaim space,
//! so the chore keeps running even when no uploads arrive.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::backend::HashStoreBackend;

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
        }
    }
}

pub struct CompactionChore {
    backend: Arc<HashStoreBackend>,
    config: CompactionConfig,
}

impl CompactionChore {
    pub fn new(backend: Arc<HashStoreBackend>, config: CompactionConfig) -> Self {
        Self { backend, config }
    }

    /// One sweep over all open databases.
    pub fn run_once(&self) {
        if let Err(err) = self.backend.compact_if_needed(Utc::now()) {
            error!(error = %err, "compaction sweep failed");
        }
    }

    /// Run until the shutdown signal fires. Blocking compaction work runs
    /// on the blocking pool so the sweep does not stall the runtime.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        info!(interval = ?self.config.interval, "compaction chore started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so a fresh start does
        // not compact before anything is stored
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let backend = self.backend.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        backend.compact_if_needed(Utc::now())
                    })
                    .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(error = %err, "compaction sweep failed"),
                        Err(join_err) => error!(error = %join_err, "compaction task panicked"),
                    }
                }
                _ = &mut shutdown => {
                    info!("compaction chore stopping");
                    return;
                }
            }
        }
    }
}
