//! Upload-selection cache.
//!
//! Selecting nodes for an upload must not hit the database, so the cache
//! refreshes the candidate set in the background at a configured staleness
//! and `get_nodes` is a pure in-memory pick from the latest snapshot.
//! Candidates are split into vetted and new nodes; the caller asks for a
//! fraction of new nodes to keep vetting moving.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use galaxy_core::Clock;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::selection::{NodeFilters, SelectBySubnet};
use crate::service::Service;
use crate::types::SelectedNode;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How old a snapshot may get before `get_nodes` refreshes it.
    pub staleness: Duration,
    /// Fraction of each selection drawn from not-yet-vetted nodes.
    pub new_node_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::minutes(3),
            new_node_fraction: 0.05,
        }
    }
}

struct Snapshot {
    vetted: SelectBySubnet,
    new: SelectBySubnet,
    refreshed_at: DateTime<Utc>,
}

pub struct UploadSelectionCache {
    service: Arc<Service>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    snapshot: RwLock<Option<Snapshot>>,
}

impl UploadSelectionCache {
    pub fn new(service: Arc<Service>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            service,
            config,
            clock,
            snapshot: RwLock::new(None),
        }
    }

    /// Refresh the snapshot from the overlay.
    pub async fn refresh(&self) -> Result<()> {
        let nodes = self.service.selectable_nodes().await?;
        let (vetted, new): (Vec<SelectedNode>, Vec<SelectedNode>) =
            nodes.into_iter().partition(|n| n.vetted);
        debug!(
            vetted = vetted.len(),
            new = new.len(),
            "upload selection cache refreshed"
        );
        *self.snapshot.write().await = Some(Snapshot {
            vetted: SelectBySubnet::new(vetted),
            new: SelectBySubnet::new(new),
            refreshed_at: self.clock.now(),
        });
        Ok(())
    }

    /// Pick up to `count` nodes from the snapshot, refreshing it first if
    /// stale. The new-node share is rounded down; filters may leave the
    /// result short of `count`.
    pub async fn get_nodes(&self, count: usize, filters: &NodeFilters) -> Result<Vec<SelectedNode>> {
        let stale = {
            let snapshot = self.snapshot.read().await;
            match snapshot.as_ref() {
                Some(s) => self.clock.now() - s.refreshed_at > self.config.staleness,
                None => true,
            }
        };
        if stale {
            self.refresh().await?;
        }

        let snapshot = self.snapshot.read().await;
        let snapshot = snapshot.as_ref().expect("refreshed above");

        let new_count = (count as f64 * self.config.new_node_fraction) as usize;
        let mut picked = snapshot.new.select(new_count, filters);

        let mut exclude = filters.clone();
        exclude = exclude.with_excluded_ids(picked.iter().map(|n| n.id));
        exclude = exclude.with_excluded_subnets(picked.iter().map(|n| n.last_net.clone()));
        picked.extend(snapshot.vetted.select(count - picked.len(), &exclude));

        Ok(picked)
    }
}
