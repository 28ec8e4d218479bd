//! Metabase error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("object not found")]
    ObjectNotFound,

    #[error("pending object missing for stream")]
    PendingObjectMissing,

    #[error("segment not found")]
    SegmentNotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("node alias missing for node {0}")]
    AliasMissing(String),

    #[error("node id missing for alias {0}")]
    NodeIdMissing(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
