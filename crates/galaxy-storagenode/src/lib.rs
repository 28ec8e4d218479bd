//! Galaxy Storage Node
//!
//! Everything a storage node needs to serve pieces: the piece backend over
//! per-satellite hashstore databases, the piecestore gRPC endpoint with
//! order-limit enforcement, disk space accounting, and the retain state
//! (garbage-collection bloom filters and trash restore windows).

pub mod backend;
pub mod compaction;
pub mod endpoint;
pub mod error;
pub mod monitor;
pub mod retain;

pub use backend::{HashStoreBackend, PieceReader, PieceWriter};
pub use compaction::{CompactionChore, CompactionConfig};
pub use endpoint::{Config, Deleter, Endpoint, PiecestoreService, TrustedSatellites};
pub use error::{Error, Result};
pub use monitor::SpaceMonitor;
pub use retain::{BloomFilterManager, RestoreTimeManager};
