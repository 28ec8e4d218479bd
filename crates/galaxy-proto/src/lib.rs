//! Galaxy Protocol Buffer Definitions
//!
//! This crate contains the gRPC service definition and message types for the
//! piecestore protocol spoken between uplinks, the satellite, and storage
//! nodes.
//!
//! ## Usage
//!
//! ```ignore
//! use galaxy_proto::piecestore::{
//!     piecestore_client::PiecestoreClient,
//!     PieceDownloadRequest,
//! };
//!
//! let mut client = PiecestoreClient::connect("http://node:7777").await?;
//! let response = client.download(request).await?;
//! ```

/// Piecestore gRPC API: upload, download, delete, exists, restore-trash.
pub mod piecestore {
    tonic::include_proto!("galaxy.piecestore");
}

pub mod convert;

