//! Error types for Calluna.

use thiserror::Error;

/// Error type for all Calluna operations.
#[derive(Error, Debug)]
pub enum CallunaError {
    /// An I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error related to index structure or contents.
    #[error("Index error: {0}")]
    Index(String),

    /// An error in the supplied configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CallunaError {
    /// Create an index error.
    pub fn index<S: Into<String>>(message: S) -> Self {
        CallunaError::Index(message.into())
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        CallunaError::Config(message.into())
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CallunaError>;
