//! Galaxy Satellite Data Plane
//!
//! The subsystems that make "objects spread over many nodes" behave like a
//! reliable object store:
//!
//! - **rangedloop**: parallel catalog scan feeding pluggable observers
//! - **repair**: piece classification, segment health, and the injured
//!   segment queue
//! - **audit**: per-node reservoir sampling for audit scheduling
//! - **gracefulexit**: transfer queues and the exit worker state machine
//! - **gc**: per-node retain bloom filters
//! - **orders**: satellite-signed order limits authorizing piecestore ops
//! - **accountfreeze**: the billing-state chore over console users
//!
//! Wiring is explicit constructor calls ordered leaves-first; there is no
//! injection registry, and the only process-wide state is the tracing
//! subscriber installed by the binaries.

pub mod accountfreeze;
pub mod audit;
pub mod error;
pub mod gc;
pub mod gracefulexit;
pub mod orders;
pub mod rangedloop;
pub mod repair;
pub mod zombie;

pub use error::{Error, Result};
