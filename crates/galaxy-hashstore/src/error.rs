//! Error types for the blob store and the hashstore engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob not found")]
    NotFound,

    #[error("invalid blob ref: {0}")]
    InvalidBlobRef(String),

    #[error("hashtbl file too small: size={0}")]
    TableTooSmall(u64),

    #[error("hashtbl size mismatch: size={size} lrec={lrec}")]
    TableSizeMismatch { size: u64, lrec: u64 },

    #[error("invalid hashtbl header: {0}")]
    InvalidTableHeader(String),

    #[error("hashtbl full")]
    TableFull,

    #[error("record collision detected: put:{put} != exist:{exist}")]
    RecordCollision { put: String, exist: String },

    #[error("piece too large")]
    PieceTooLarge,

    #[error("writer already finished")]
    WriterFinished,

    #[error("store closed")]
    Closed,

    #[error("storage directory verification failed: {0}")]
    VerificationFailed(String),
}
