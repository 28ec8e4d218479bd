//! Audit scheduling.
//!
//! The audit observer rides the ranged loop and keeps a bounded reservoir of
//! segments per node, so every node gets audited at a rate proportional to
//! how much data it stores without the observer holding the whole catalog
//! in memory. At the end of the iteration the reservoirs become the audit
//! queue for the verification workers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use galaxy_core::NodeId;
use galaxy_metabase::Segment;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::rangedloop::{Observer, Partial};

/// A segment chosen for audit on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSegment {
    pub stream_id: Uuid,
    pub position: u64,
    pub piece_number: u16,
}

/// Classic reservoir sampler of fixed capacity.
#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: usize,
    pub segments: Vec<AuditSegment>,
    seen: u64,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            segments: Vec::with_capacity(capacity),
            seen: 0,
        }
    }

    pub fn sample(&mut self, segment: AuditSegment) {
        self.seen += 1;
        if self.segments.len() < self.capacity {
            self.segments.push(segment);
            return;
        }
        let slot = rand::thread_rng().gen_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.segments[slot as usize] = segment;
        }
    }

    /// Merge another reservoir, keeping the seen-count weighting roughly
    /// proportional.
    fn merge(&mut self, other: Reservoir) {
        let other_seen = other.seen;
        let other_len = other.segments.len() as u64;
        for segment in other.segments {
            self.sample(segment);
        }
        // sample() already counted each merged segment once
        self.seen += other_seen.saturating_sub(other_len);
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }
}

pub struct AuditObserver {
    reservoir_size: usize,
    reservoirs: Arc<Mutex<HashMap<NodeId, Reservoir>>>,
}

impl AuditObserver {
    pub fn new(reservoir_size: usize) -> Self {
        Self {
            reservoir_size,
            reservoirs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drain the per-node reservoirs into a shuffled audit queue.
    pub async fn take_queue(&self) -> Vec<(NodeId, AuditSegment)> {
        let mut reservoirs = self.reservoirs.lock().await;
        let mut queue = Vec::new();
        for (node, reservoir) in reservoirs.drain() {
            for segment in reservoir.segments {
                queue.push((node, segment));
            }
        }
        queue.shuffle(&mut rand::thread_rng());
        queue
    }
}

struct AuditFork {
    reservoir_size: usize,
    reservoirs: HashMap<NodeId, Reservoir>,
}

#[async_trait]
impl Partial for AuditFork {
    async fn process(&mut self, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            for piece in &segment.pieces {
                self.reservoirs
                    .entry(piece.storage_node)
                    .or_insert_with(|| Reservoir::new(self.reservoir_size))
                    .sample(AuditSegment {
                        stream_id: segment.stream_id,
                        position: segment.position.encode(),
                        piece_number: piece.number,
                    });
            }
        }
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[async_trait]
impl Observer for AuditObserver {
    async fn start(&mut self, _start_time: DateTime<Utc>) -> Result<()> {
        self.reservoirs.lock().await.clear();
        Ok(())
    }

    async fn fork(&mut self) -> Result<Box<dyn Partial>> {
        Ok(Box::new(AuditFork {
            reservoir_size: self.reservoir_size,
            reservoirs: HashMap::new(),
        }))
    }

    async fn join(&mut self, partial: Box<dyn Partial>) -> Result<()> {
        let fork = partial
            .into_any()
            .downcast::<AuditFork>()
            .map_err(|_| Error::Observer("expected audit fork".to_string()))?;

        let mut reservoirs = self.reservoirs.lock().await;
        for (node, reservoir) in fork.reservoirs {
            match reservoirs.get_mut(&node) {
                Some(existing) => existing.merge(reservoir),
                None => {
                    reservoirs.insert(node, reservoir);
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let reservoirs = self.reservoirs.lock().await;
        info!(nodes = reservoirs.len(), "audit reservoirs collected");
        Ok(())
    }
}
