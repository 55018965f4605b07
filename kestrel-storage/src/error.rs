//! Error types for the kestrel-storage crate.
//!
//! Everything an engine can fail with funnels into [`StorageError`]; the
//! broker above treats most of these as "no result" (an empty claim, a
//! dropped frame) because persistence was already promised at store time.

use std::io;

use thiserror::Error;

/// Top-level storage error type.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O operation failed (body file read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The metadata database rejected an operation.
    #[error("Database error: {0}")]
    Database(String),

    /// A schema migration could not be applied.
    #[error("Migration to {version} failed: {reason}")]
    Migration { version: String, reason: String },

    /// A configuration value is invalid.
    #[error("Invalid configuration for {field}: {reason}")]
    Configuration { field: &'static str, reason: String },

    /// The engine's bookkeeping and the disk disagree.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// The engine has begun (or finished) shutting down.
    #[error("Storage is shutting down")]
    ShuttingDown,

    /// Internal error (lock poisoning, lost worker, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specialized `Result` type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

// Convenience conversion for lock poisoning
impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}
