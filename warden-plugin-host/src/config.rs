//! Host configuration, read from `host.toml`.
//!
//! ```toml
//! [sandbox]
//! execution_timeout_ms = 30000
//!
//! [storage]
//! backend = "sqlite"
//! path = "/var/lib/warden/plugins.db"
//!
//! [network]
//! allowed_hosts = ["api.example.com", "*.cdn.example.com"]
//!
//! [permissions]
//! default_grants = ["logger"]
//! ```

use crate::capability::Capability;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use warden_storage::StorageConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// How long unload waits for a guest thread to exit after interruption.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Linear memory ceiling for wasm guests.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
}

fn default_execution_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_max_memory_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: default_execution_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_memory_bytes: default_max_memory_bytes(),
        }
    }
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Exact hostnames or `*.suffix` wildcards.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_network_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_network_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    format!("warden/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            timeout_ms: default_network_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// When set, a denial is remembered and later calls fail without prompting.
    #[serde(default)]
    pub remember_denials: bool,
    /// Capabilities every plugin holds from load.
    #[serde(default)]
    pub default_grants: Vec<Capability>,
}

impl HostConfig {
    /// Strict parse; any error is returned.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Loads config from `path`. A missing or unparsable file falls back to
    /// defaults with a warning.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!("No host config at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded host config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse host config {:?}: {}. Falling back to defaults.",
                        path, e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read host config {:?}: {}", path, e);
                Self::default()
            }
        }
    }
}
