//! Storage node error types and their RPC status mapping.

use thiserror::Error;
use tonic::Status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing piece id")]
    MissingPieceId,

    #[error("expected put or put repair action, got {0:?}")]
    ExpectedPut(galaxy_core::Action),

    #[error("expected get or get repair action, got {0:?}")]
    ExpectedGet(galaxy_core::Action),

    #[error("expected delete action, got {0:?}")]
    ExpectedDelete(galaxy_core::Action),

    #[error("untrusted satellite {0}")]
    UntrustedSatellite(String),

    #[error("order limit expired")]
    OrderLimitExpired,

    #[error("order limit signature invalid")]
    BadOrderLimitSignature,

    #[error("order signature invalid")]
    BadOrderSignature,

    #[error("order not ascending")]
    OrderNotAscending,

    #[error("order limit exceeded: {used} > {limit}")]
    OrderLimitExceeded { used: u64, limit: u64 },

    #[error("not enough available disk space, have: {have}, need: {need}")]
    OutOfSpace { have: u64, need: u64 },

    #[error("speed too low: {rate} bytes/s below minimum {minimum}")]
    SpeedTooLow { rate: u64, minimum: u64 },

    #[error("too many requests")]
    TooManyRequests,

    #[error("piece too large")]
    PieceTooLarge,

    #[error("file does not exist")]
    NotFound,

    #[error("piece hash mismatch")]
    HashMismatch,

    #[error("header too large")]
    HeaderTooLarge,

    #[error("footer too small")]
    FooterTooSmall,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("signing error: {0}")]
    Signing(#[from] galaxy_core::Error),

    #[error("store error: {0}")]
    Store(#[from] galaxy_hashstore::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] prost::DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<galaxy_proto::convert::ConvertError> for Error {
    fn from(err: galaxy_proto::convert::ConvertError) -> Error {
        match err {
            galaxy_proto::convert::ConvertError::MissingPieceId => Error::MissingPieceId,
            galaxy_proto::convert::ConvertError::InvalidMessage(msg) => {
                Error::InvalidMessage(msg)
            }
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Status {
        match &err {
            Error::MissingPieceId
            | Error::ExpectedPut(_)
            | Error::ExpectedGet(_)
            | Error::ExpectedDelete(_)
            | Error::InvalidMessage(_)
            | Error::PieceTooLarge => Status::invalid_argument(err.to_string()),
            Error::UntrustedSatellite(_)
            | Error::BadOrderLimitSignature
            | Error::BadOrderSignature
            | Error::OrderNotAscending
            | Error::OrderLimitExpired
            | Error::Signing(_) => Status::permission_denied(err.to_string()),
            Error::OrderLimitExceeded { .. } | Error::HashMismatch => {
                Status::failed_precondition(err.to_string())
            }
            Error::OutOfSpace { .. } => Status::resource_exhausted(err.to_string()),
            Error::TooManyRequests => Status::unavailable(err.to_string()),
            Error::SpeedTooLow { .. } => Status::aborted(err.to_string()),
            Error::NotFound => Status::not_found(err.to_string()),
            Error::HeaderTooLarge
            | Error::FooterTooSmall
            | Error::Store(_)
            | Error::Encoding(_)
            | Error::Io(_) => Status::internal(err.to_string()),
        }
    }
}
