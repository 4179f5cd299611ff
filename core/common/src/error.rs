//! Common error types for satchel.

use thiserror::Error;

/// Top-level error type for vault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The password did not unlock the control file or the index.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Index store query, DDL or transaction failed.
    #[error("Index error: {0}")]
    Index(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not enough free space left on the vault device.
    #[error("Insufficient space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// An internal invariant was violated. Batches stop on this.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether this error must stop the whole batch instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Invariant(_) | Error::InsufficientSpace { .. })
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
