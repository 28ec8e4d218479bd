//! Uplink error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("node returned no piece hash")]
    MissingNodeHash,

    #[error("node hash does not match uploaded data")]
    NodeHashMismatch,

    #[error("node signature invalid")]
    BadNodeSignature,

    #[error("downloaded data fails hash verification")]
    DownloadHashMismatch,

    #[error("malformed response: {0}")]
    MalformedResponse(#[from] galaxy_proto::convert::ConvertError),

    #[error("signing error: {0}")]
    Signing(#[from] galaxy_core::Error),
}
