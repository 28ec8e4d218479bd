//! Galaxy Uplink
//!
//! Client-side access to storage nodes: streaming piece uploads with
//! forward-chained signed orders, and downloads with provenance
//! verification. Erasure coding and key management sit above this layer;
//! this crate only speaks the piecestore protocol correctly.

pub mod error;
pub mod piecestore;

pub use error::{Error, Result};
pub use piecestore::{DownloadedPiece, PiecestoreClient};
