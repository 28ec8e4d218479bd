//! Garbage-collection bloom filter generation.
//!
//! Walks the catalog and accumulates, per storage node, the set of piece ids
//! that node is still expected to hold. At the end of the pass the sets
//! become bloom filters sized for the configured false-positive rate, ready
//! to ship to nodes so they can trash everything else. Whether this observer
//! is wired into a deployment is a config decision; correctness does not
//! depend on it running.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bloomfilter::Bloom;
use chrono::{DateTime, Utc};
use galaxy_core::{NodeId, PieceId};
use galaxy_metabase::Segment;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::rangedloop::{Observer, Partial};

pub struct GcObserver {
    false_positive_rate: f64,
    pieces: Arc<Mutex<HashMap<NodeId, HashSet<PieceId>>>>,
}

impl GcObserver {
    pub fn new(false_positive_rate: f64) -> Self {
        Self {
            false_positive_rate,
            pieces: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build and drain the per-node filters.
    pub async fn take_filters(&self) -> HashMap<NodeId, Bloom<[u8]>> {
        let mut pieces = self.pieces.lock().await;
        let mut filters = HashMap::with_capacity(pieces.len());
        for (node, ids) in pieces.drain() {
            let mut filter =
                Bloom::new_for_fp_rate(ids.len().max(1), self.false_positive_rate);
            for id in &ids {
                filter.set(id.as_bytes().as_slice());
            }
            filters.insert(node, filter);
        }
        filters
    }
}

struct GcFork {
    pieces: HashMap<NodeId, HashSet<PieceId>>,
}

#[async_trait]
impl Partial for GcFork {
    async fn process(&mut self, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            for piece in &segment.pieces {
                let piece_id = segment.root_piece_id.derive(piece.number);
                self.pieces
                    .entry(piece.storage_node)
                    .or_default()
                    .insert(piece_id);
            }
        }
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[async_trait]
impl Observer for GcObserver {
    async fn start(&mut self, _start_time: DateTime<Utc>) -> Result<()> {
        self.pieces.lock().await.clear();
        Ok(())
    }

    async fn fork(&mut self) -> Result<Box<dyn Partial>> {
        Ok(Box::new(GcFork {
            pieces: HashMap::new(),
        }))
    }

    async fn join(&mut self, partial: Box<dyn Partial>) -> Result<()> {
        let fork = partial
            .into_any()
            .downcast::<GcFork>()
            .map_err(|_| Error::Observer("expected gc fork".to_string()))?;
        let mut pieces = self.pieces.lock().await;
        for (node, ids) in fork.pieces {
            pieces.entry(node).or_default().extend(ids);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let pieces = self.pieces.lock().await;
        let total: usize = pieces.values().map(|set| set.len()).sum();
        info!(nodes = pieces.len(), pieces = total, "gc piece sets collected");
        Ok(())
    }
}
