//! Error types for the protocol server

use thiserror::Error;
use tidepool_core::MergeError;
use tidepool_store::StoreError;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Messenger error: {0}")]
    Messenger(String),

    #[error("Connection directory error: {0}")]
    Directory(String),
}

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;
