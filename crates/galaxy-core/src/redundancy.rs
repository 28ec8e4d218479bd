//! Erasure-coding scheme parameters attached to every remote segment.

use serde::{Deserialize, Serialize};

/// Share counts for a Reed-Solomon style scheme.
///
/// `required` shares reconstruct the segment, `repair` is the threshold at
/// which the checker queues the segment, `optimal` is the success target for
/// uploads and repairs, and `total` is how many shares are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedundancyScheme {
    pub required: u16,
    pub repair: u16,
    pub optimal: u16,
    pub total: u16,
}

impl RedundancyScheme {
    pub fn new(required: u16, repair: u16, optimal: u16, total: u16) -> Self {
        Self {
            required,
            repair,
            optimal,
            total,
        }
    }

    /// Compact display used to key per-scheme statistics.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.required, self.repair, self.optimal, self.total
        )
    }
}

impl Default for RedundancyScheme {
    fn default() -> Self {
        Self::new(29, 35, 80, 110)
    }
}
