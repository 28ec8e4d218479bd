//! Satellite error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("observer error: {0}")]
    Observer(String),

    #[error("ranged loop worker panicked")]
    WorkerPanicked,

    #[error("node {0} is too young to exit, minimum age is {1} months")]
    ExitIneligible(String, u32),

    #[error("user not found")]
    UserNotFound,

    #[error("metabase error: {0}")]
    Metabase(#[from] galaxy_metabase::Error),

    #[error("overlay error: {0}")]
    Overlay(#[from] galaxy_overlay::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
