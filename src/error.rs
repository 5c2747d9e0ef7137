//! Error types for the floodgate crate.

use thiserror::Error;

use crate::limit::backend::StoreError;

/// Main error type for limiter operations.
///
/// Nothing on the request path returns these: quota rejections surface
/// through the exceeded handler and backend failures are absorbed by the
/// fail-open policy. Construction and policy loading are the only fallible
/// surfaces.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
