//! Core type definitions shared by the warden crates.
//!
//! - Plugin identifiers (the namespace key for storage and logging)
//! - Correlation identifiers for the host <-> isolation context protocol
//! - Millisecond wall-clock helpers used for TTLs and message timestamps

mod ids;
mod time;

pub use ids::{CorrelationId, PluginId};
pub use time::{UnixMillis, now_millis};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur constructing core types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid plugin id '{id}': {reason}")]
    InvalidPluginId { id: String, reason: &'static str },

    #[error("invalid correlation id: {0}")]
    InvalidCorrelationId(#[from] uuid::Error),
}
