//! Graceful exit.
//!
//! When a node signals intent to leave, the overlay records
//! `exit_initiated_at`. On the next full ranged-loop pass the exit observer
//! materializes every segment holding a piece on an exiting node into that
//! node's transfer queue. A worker then drains the queue, re-uploading each
//! piece to a replacement node, and the exit finishes as a success when the
//! queue empties, or as a failure when the deadline passes or too many
//! transfers fail. Either way `exit_finished_at` is set and the node never
//! exits twice.

pub mod queue;
pub mod worker;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use galaxy_core::NodeId;
use galaxy_metabase::Segment;
use galaxy_overlay::Service as OverlayService;
use tracing::info;

use crate::error::{Error, Result};
use crate::rangedloop::{Observer, Partial};
use self::queue::{TransferItem, TransferQueue};

pub use self::worker::{ExitConfig, ExitWorker, PieceTransfer, TransferError};

/// Builds per-node transfer queues for exiting nodes.
pub struct GracefulExitObserver {
    overlay: Arc<OverlayService>,
    queue: Arc<TransferQueue>,
    exiting: Arc<HashSet<NodeId>>,
}

impl GracefulExitObserver {
    pub fn new(overlay: Arc<OverlayService>, queue: Arc<TransferQueue>) -> Self {
        Self {
            overlay,
            queue,
            exiting: Arc::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl Observer for GracefulExitObserver {
    async fn start(&mut self, _start_time: DateTime<Utc>) -> Result<()> {
        let exiting: HashSet<NodeId> = self
            .overlay
            .exiting_nodes()
            .await?
            .into_iter()
            .map(|d| d.node_id)
            .collect();
        info!(exiting = exiting.len(), "graceful exit pass starting");
        self.exiting = Arc::new(exiting);
        Ok(())
    }

    async fn fork(&mut self) -> Result<Box<dyn Partial>> {
        Ok(Box::new(GracefulExitFork {
            exiting: self.exiting.clone(),
            items: HashMap::new(),
        }))
    }

    async fn join(&mut self, partial: Box<dyn Partial>) -> Result<()> {
        let fork = partial
            .into_any()
            .downcast::<GracefulExitFork>()
            .map_err(|_| Error::Observer("expected graceful exit fork".to_string()))?;
        for (node, items) in fork.items {
            self.queue.enqueue(node, &items).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        for node in self.exiting.iter() {
            let pending = self.queue.incomplete_count(*node).await?;
            info!(node = %node, pending, "transfer queue materialized");
        }
        Ok(())
    }
}

struct GracefulExitFork {
    exiting: Arc<HashSet<NodeId>>,
    items: HashMap<NodeId, Vec<TransferItem>>,
}

#[async_trait]
impl Partial for GracefulExitFork {
    async fn process(&mut self, segments: &[Segment]) -> Result<()> {
        if self.exiting.is_empty() {
            return Ok(());
        }
        for segment in segments {
            for piece in &segment.pieces {
                if self.exiting.contains(&piece.storage_node) {
                    self.items
                        .entry(piece.storage_node)
                        .or_default()
                        .push(TransferItem {
                            node_id: piece.storage_node,
                            stream_id: segment.stream_id,
                            position: segment.position.encode(),
                            piece_number: piece.number,
                        });
                }
            }
        }
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
