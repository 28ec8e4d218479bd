//! Core Types for Galaxy
//!
//! This crate defines the vocabulary shared by every Galaxy process role:
//! satellites, storage nodes, and uplinks.
//!
//! - **Identifiers**: node ids (proof-of-work derived), piece ids, stream
//!   serial numbers
//! - **Redundancy**: the erasure-coding scheme attached to every segment
//! - **Placement**: region constraints limiting which nodes may hold pieces
//! - **Orders**: satellite-signed tickets authorizing piecestore operations,
//!   and the piece hashes nodes sign on commit
//! - **Account signatures**: the wallet-style recoverable signature used to
//!   bind a key pair to a console account
//! - **Clock**: an injectable time source so chores are testable
//!
//! Everything here is plain data plus signing helpers. No I/O happens in this
//! crate.

pub mod clock;
pub mod error;
pub mod id;
pub mod orders;
pub mod placement;
pub mod redundancy;
pub mod signature;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use id::{NodeId, PieceId, SerialNumber};
pub use orders::{Action, Order, OrderLimit, PieceHash, PieceHashAlgorithm};
pub use placement::PlacementConstraint;
pub use redundancy::RedundancyScheme;
