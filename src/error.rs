use std::io;

use thiserror::Error;

/// Errors reported by blob and metadata store backends.
///
/// Every backend reports an absent id or source as [`StoreError::NotFound`],
/// never as an `Ok` with an empty value.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid key `{0}`")]
    InvalidKey(String),

    #[error("invalid store config: {0}")]
    Config(String),

    #[error("unknown backend `{0}`")]
    UnknownBackend(String),

    #[error("store is not initialized")]
    Uninitialized,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to (de)serialize record")]
    Serialization(#[from] postcard::Error),

    #[error(transparent)]
    Backend(#[from] fjall::Error),

    #[error("write transaction conflicted with a concurrent writer")]
    Conflict,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn config(err: impl std::fmt::Display) -> Self {
        Self::Config(err.to_string())
    }
}
