//! Error types for the plugin host.

use crate::message::ErrorPayload;
use thiserror::Error;

pub type PluginHostResult<T> = Result<T, PluginHostError>;

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    #[error("wasm engine error: {0}")]
    Engine(#[from] wasmtime::Error),

    #[error("plugin '{plugin_id}' is already executing")]
    ExecutionInProgress { plugin_id: String },

    #[error("plugin '{plugin_id}' has been terminated")]
    Terminated { plugin_id: String },

    #[error(
        "execution timeout: plugin '{plugin_id}' exceeded {timeout_ms}ms deadline \
         ({rejected_calls} pending calls rejected)"
    )]
    ExecutionTimeout {
        plugin_id: String,
        timeout_ms: u64,
        rejected_calls: usize,
    },

    #[error("sandbox faulted: {plugin_id}: {message}")]
    SandboxFaulted {
        plugin_id: String,
        message: String,
        /// The uncaught host error that ended the execution, if any.
        cause: Option<ErrorPayload>,
    },

    #[error("failed to start isolation context for '{plugin_id}': {message}")]
    ContextStart { plugin_id: String, message: String },

    #[error("invalid plugin id: {0}")]
    InvalidPluginId(#[from] warden_types::Error),

    #[error("storage error: {0}")]
    Storage(#[from] warden_storage::StorageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginHostError {
    /// Whether this error left the sandbox instance in `Terminated`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionTimeout { .. } | Self::SandboxFaulted { .. } | Self::Terminated { .. }
        )
    }
}
