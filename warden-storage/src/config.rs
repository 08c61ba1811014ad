//! Storage configuration, read from the `[storage]` section of the host config.

use crate::backend::{MemoryBackend, StorageBackend};
use crate::error::StorageResult;
use crate::sqlite::SqliteBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use warden_crypto::{DEFAULT_KDF_ITERATIONS, KdfParams};

/// Which record store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

/// Per-plugin quota override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaOverride {
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
    #[serde(default)]
    pub max_keys: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Database file for the SQLite backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_max_keys")]
    pub max_keys: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    #[serde(default)]
    pub quota_overrides: HashMap<String, QuotaOverride>,
}

fn default_max_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_keys() -> u64 {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_true() -> bool {
    true
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: None,
            max_size_bytes: default_max_size_bytes(),
            max_keys: default_max_keys(),
            sweep_interval_secs: default_sweep_interval_secs(),
            encrypt: true,
            kdf_iterations: default_kdf_iterations(),
            quota_overrides: HashMap::new(),
        }
    }
}

impl StorageConfig {
    /// Returns `(max_size_bytes, max_keys)` for a plugin.
    pub fn limits_for(&self, plugin_id: &str) -> (u64, u64) {
        match self.quota_overrides.get(plugin_id) {
            Some(o) => (
                o.max_size_bytes.unwrap_or(self.max_size_bytes),
                o.max_keys.unwrap_or(self.max_keys),
            ),
            None => (self.max_size_bytes, self.max_keys),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            iterations: self.kdf_iterations,
        }
    }
}

/// Opens the backend named by the config.
pub fn open_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendKind::Sqlite => match &config.path {
            Some(path) => Ok(Arc::new(SqliteBackend::open(path)?)),
            None => Ok(Arc::new(SqliteBackend::open_in_memory()?)),
        },
    }
}
