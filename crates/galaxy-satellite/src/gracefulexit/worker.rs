//! The exit worker.
//!
//! Drains one node's transfer queue, re-uploading each piece through a
//! `PieceTransfer` implementation, and finalizes the node's exit status.
//! Eligibility is checked up front: nodes younger than the configured
//! minimum age are refused before any queue rows are consumed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use galaxy_core::{Clock, NodeId};
use galaxy_overlay::{ExitStatusRequest, Service as OverlayService};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::gracefulexit::queue::{TransferItem, TransferQueue};

#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Minimum node age before an exit is accepted.
    pub node_min_age_months: u32,
    /// Wall-clock budget for the whole exit, measured from initiation.
    pub overall_deadline: Duration,
    /// Exit fails once this fraction of attempted transfers failed.
    pub max_failure_rate: f64,
    /// Queue page size.
    pub batch_size: i64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            node_min_age_months: 6,
            overall_deadline: Duration::days(30),
            max_failure_rate: 0.1,
            batch_size: 100,
        }
    }
}

/// Transfer failure classification: retriable failures stay queued,
/// permanent ones count against the failure rate.
#[derive(Debug)]
pub enum TransferError {
    Permanent(String),
    Retriable(String),
}

/// Moves one piece from the exiting node to a replacement.
#[async_trait]
pub trait PieceTransfer: Send + Sync {
    async fn transfer(&self, item: &TransferItem) -> std::result::Result<(), TransferError>;
}

pub struct ExitWorker {
    overlay: Arc<OverlayService>,
    queue: Arc<TransferQueue>,
    transfer: Arc<dyn PieceTransfer>,
    config: ExitConfig,
    clock: Arc<dyn Clock>,
}

impl ExitWorker {
    pub fn new(
        overlay: Arc<OverlayService>,
        queue: Arc<TransferQueue>,
        transfer: Arc<dyn PieceTransfer>,
        config: ExitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            overlay,
            queue,
            transfer,
            config,
            clock,
        }
    }

    /// Run one node's exit to completion. Returns whether it succeeded.
    pub async fn run(&self, node_id: NodeId) -> Result<bool> {
        let dossier = self.overlay.get(&node_id).await?;

        let min_age = Duration::days(self.config.node_min_age_months as i64 * 30);
        if self.clock.now() - dossier.created_at < min_age {
            return Err(Error::ExitIneligible(
                node_id.to_string(),
                self.config.node_min_age_months,
            ));
        }

        let initiated = dossier.exit_initiated_at.unwrap_or_else(|| self.clock.now());
        let deadline = initiated + self.config.overall_deadline;

        let mut attempted = 0u64;
        let mut failed = 0u64;

        let success = loop {
            if self.clock.now() > deadline {
                warn!(node = %node_id, "graceful exit deadline passed");
                break false;
            }

            let items = self.queue.incomplete(node_id, self.config.batch_size).await?;
            if items.is_empty() {
                break true;
            }

            let mut progressed = false;
            for item in &items {
                attempted += 1;
                match self.transfer.transfer(item).await {
                    Ok(()) => {
                        self.queue.mark_transferred(item).await?;
                        progressed = true;
                    }
                    Err(TransferError::Retriable(reason)) => {
                        warn!(node = %node_id, reason, "transfer failed, will retry");
                    }
                    Err(TransferError::Permanent(reason)) => {
                        failed += 1;
                        self.queue.mark_failed(item).await?;
                        warn!(node = %node_id, reason, "transfer failed permanently");
                    }
                }
            }

            if attempted > 0 && failed as f64 / attempted as f64 > self.config.max_failure_rate {
                warn!(node = %node_id, failed, attempted, "failure rate exceeded");
                break false;
            }

            // when a full round moves nothing the remaining queue is
            // undeliverable
            if !progressed {
                warn!(node = %node_id, remaining = items.len(), "no transfer progress");
                break false;
            }
        };

        self.overlay
            .update_exit_status(ExitStatusRequest {
                node_id,
                exit_initiated_at: Some(initiated),
                exit_finished_at: Some(self.clock.now()),
                exit_success: success,
            })
            .await?;

        let progress = self.queue.progress(node_id).await?;
        info!(
            node = %node_id,
            success,
            transferred = progress.pieces_transferred,
            failed = progress.pieces_failed,
            "graceful exit finished"
        );
        Ok(success)
    }
}
