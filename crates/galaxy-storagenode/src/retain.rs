//! Garbage-collection state: bloom filters and restore windows.
//!
//! The satellite periodically ships each node a bloom filter of every piece
//! it still knows about. A piece absent from the filter is garbage and gets
//! flagged trash at the next compaction; false positives only mean some
//! garbage survives a round. Restore windows are the inverse safety valve:
//! after an accidental deletion the satellite asks the node to lazily
//! restore trashed pieces on read until the window's instant.

use std::collections::HashMap;
use std::sync::Mutex;

use bloomfilter::Bloom;
use chrono::{DateTime, Utc};
use galaxy_core::NodeId;
use tracing::info;

/// Per-satellite bloom filters of retained piece ids.
#[derive(Default)]
pub struct BloomFilterManager {
    filters: Mutex<HashMap<NodeId, Bloom<[u8]>>>,
}

impl BloomFilterManager {
    /// Install the latest filter for a satellite.
    pub fn set_filter(&self, satellite: NodeId, filter: Bloom<[u8]>) {
        info!(satellite = %satellite, "retain bloom filter installed");
        self.filters.lock().unwrap().insert(satellite, filter);
    }

    /// Whether a key should be flagged trash: true when a filter exists and
    /// the key is not in it. Without a filter nothing is trashed.
    pub fn should_trash(&self, satellite: NodeId, key: &[u8; 32], _now: DateTime<Utc>) -> bool {
        let filters = self.filters.lock().unwrap();
        match filters.get(&satellite) {
            Some(filter) => !filter.check(key.as_slice()),
            None => false,
        }
    }
}

/// Per-satellite lazy-restore windows.
#[derive(Default)]
pub struct RestoreTimeManager {
    times: Mutex<HashMap<NodeId, DateTime<Utc>>>,
}

impl RestoreTimeManager {
    pub fn set_restore_time(&self, satellite: NodeId, at: DateTime<Utc>) {
        info!(satellite = %satellite, at = %at, "trash restore window opened");
        self.times.lock().unwrap().insert(satellite, at);
    }

    pub fn restore_time(&self, satellite: NodeId) -> Option<DateTime<Utc>> {
        self.times.lock().unwrap().get(&satellite).copied()
    }
}
