//! Error types for the storage layer.

use crate::quota::QuotaLimit;
use thiserror::Error;
use warden_crypto::CryptoError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A write would push the namespace over one of its limits.
    /// Nothing was persisted.
    #[error("quota exceeded for plugin '{plugin_id}': {limit}")]
    QuotaExceeded { plugin_id: String, limit: QuotaLimit },

    /// The stored ciphertext did not authenticate under the namespace key.
    #[error("authentication failed for '{key}' in plugin '{plugin_id}': wrong key or tampered data")]
    AuthenticationFailure { plugin_id: String, key: String },

    /// Key rejected before touching storage.
    #[error("invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Any other crypto failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Backend-specific failure that is not a database error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot handed to import was inconsistent.
    #[error("invalid snapshot: {0}")]
    SnapshotInvalid(String),
}
