//! Error types shared by the core helpers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid identifier length: expected {expected}, got {got}")]
    InvalidIdLength { expected: usize, got: usize },

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("signature verification failed")]
    BadSignature,

    #[error("signature is invalid: {0}")]
    MalformedSignature(String),

    #[error("identity difficulty {got} below required {required}")]
    InsufficientDifficulty { got: u16, required: u16 },

    #[error("unknown hash algorithm: {0}")]
    UnknownHashAlgorithm(i32),

    #[error("unknown action: {0}")]
    UnknownAction(i32),
}
