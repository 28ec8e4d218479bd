//! Zombie object deletion.
//!
//! Pending uploads carry a deadline; when a client abandons an upload
//! without committing or deleting it, the pending record would otherwise
//! sit in the catalog forever. This chore reaps pending objects past their
//! deadline on a timer. It is idempotent and a missed tick is harmless,
//! the next one catches up.

use std::sync::Arc;
use std::time::Duration;

use galaxy_core::Clock;
use galaxy_metabase::Metabase;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ZombieDeletionConfig {
    pub interval: Duration,
}

impl Default for ZombieDeletionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
        }
    }
}

pub struct ZombieDeletionChore {
    metabase: Arc<Metabase>,
    config: ZombieDeletionConfig,
    clock: Arc<dyn Clock>,
}

impl ZombieDeletionChore {
    pub fn new(
        metabase: Arc<Metabase>,
        config: ZombieDeletionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            metabase,
            config,
            clock,
        }
    }

    /// One reaping pass. Returns how many pending objects were removed.
    pub async fn run_once(&self) -> Result<u64> {
        let deleted = self
            .metabase
            .delete_zombie_objects(self.clock.now())
            .await?;
        Ok(deleted)
    }

    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        info!(interval = ?self.config.interval, "zombie deletion chore started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "zombie deletion pass failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("zombie deletion chore stopping");
                    return;
                }
            }
        }
    }
}
