//! Common error types for reposync.

use thiserror::Error;

/// Top-level error type for reposync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Manifest is inconsistent or an edit would break its invariants.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Repository storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted (or not supported by this transport).
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Transient transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// A location could not be opened as a repository by any transport.
    #[error("Could not resolve repository: {0}")]
    Resolution(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
