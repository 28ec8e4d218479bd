//! Disk space accounting.
//!
//! The node operator allocates a byte budget; the monitor reports what is
//! left of it after live pieces. Uploads are refused up front when the
//! declared order limit would not fit.

use std::sync::Arc;

use crate::backend::HashStoreBackend;

pub struct SpaceMonitor {
    allocated: u64,
    backend: Arc<HashStoreBackend>,
}

impl SpaceMonitor {
    pub fn new(allocated: u64, backend: Arc<HashStoreBackend>) -> Self {
        Self { allocated, backend }
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn used(&self) -> u64 {
        self.backend.space_used()
    }

    pub fn available(&self) -> u64 {
        self.allocated.saturating_sub(self.used())
    }
}
