//! Segment repair: classification, the injured-segment queue, and the
//! checker observer that connects them to the ranged loop.

pub mod checker;
pub mod classify;
pub mod queue;

pub use self::checker::{AggregateStats, CheckerConfig, CheckerObserver};
pub use self::classify::{classify_pieces, segment_health, ClassifyOptions, NodeSummary, PiecesCheck};
pub use self::queue::{InjuredSegment, InsertBuffer, RepairQueue};
