//! Overlay error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid check-in: {0}")]
    InvalidCheckIn(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
