//! Error types for the ratelimit crate.

use thiserror::Error;

/// Main error type for ratelimit operations.
///
/// Bucket operations themselves never fail once a bucket exists; errors only
/// arise while constructing buckets and flows or loading configuration.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// A bucket or flow was constructed with out-of-range parameters
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ratelimit operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
