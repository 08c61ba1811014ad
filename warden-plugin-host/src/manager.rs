//! Central plugin lifecycle manager.
//!
//! Owns every live [`SandboxInstance`], the shared host services and the
//! permission broker. At most one live instance exists per plugin id; a
//! terminated instance stays visible until it is unloaded or replaced by
//! a fresh `load`.

use crate::api::HostServices;
use crate::broker::{ConsentProvider, PermissionBroker};
use crate::capability::Capability;
use crate::config::HostConfig;
use crate::error::{PluginHostError, PluginHostResult};
use crate::network::{HttpFetcher, NetworkPolicy, ReqwestFetcher};
use crate::permissions::{GrantSource, PermissionLedger};
use crate::runtime::{RuntimeKind, runtime_for};
use crate::sandbox::{SandboxInstance, SandboxState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use warden_storage::{KeySource, StorageEngine, Sweeper, open_backend};
use warden_types::PluginId;

/// What the host needs to load a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: PluginId,
    #[serde(default)]
    pub runtime: RuntimeKind,
    /// Script text, or a wasm module in WAT text form.
    pub source: String,
    /// Capabilities granted before the first execution.
    #[serde(default)]
    pub permissions: Vec<Capability>,
}

impl PluginManifest {
    pub fn new(id: PluginId, runtime: RuntimeKind, source: impl Into<String>) -> Self {
        Self {
            id,
            runtime,
            source: source.into(),
            permissions: Vec::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Capability>) -> Self {
        self.permissions.extend(permissions);
        self
    }
}

struct LoadedPlugin {
    manifest: PluginManifest,
    instance: Arc<SandboxInstance>,
}

pub struct PluginHostManager {
    config: HostConfig,
    services: Arc<HostServices>,
    broker: Arc<PermissionBroker>,
    plugins: Mutex<HashMap<PluginId, LoadedPlugin>>,
}

impl PluginHostManager {
    /// Opens the configured storage backend and builds a manager with the
    /// default `reqwest` fetcher.
    pub fn open(
        config: HostConfig,
        key_source: KeySource,
        consent: Arc<dyn ConsentProvider>,
    ) -> PluginHostResult<Self> {
        let backend = open_backend(&config.storage)?;
        let storage = Arc::new(StorageEngine::new(backend, config.storage.clone(), key_source));
        let fetcher = ReqwestFetcher::new(&config.network)
            .map_err(|e| PluginHostError::Config(format!("http client: {e:#}")))?;
        Ok(Self::new(config, storage, Arc::new(fetcher), consent))
    }

    pub fn new(
        config: HostConfig,
        storage: Arc<StorageEngine>,
        fetcher: Arc<dyn HttpFetcher>,
        consent: Arc<dyn ConsentProvider>,
    ) -> Self {
        let services = HostServices::new(storage, NetworkPolicy::from_config(&config.network), fetcher);
        Self::with_services(config, services, consent)
    }

    pub fn with_services(
        config: HostConfig,
        services: HostServices,
        consent: Arc<dyn ConsentProvider>,
    ) -> Self {
        let broker = PermissionBroker::new(consent, config.permissions.remember_denials);
        Self {
            config,
            services: Arc::new(services),
            broker: Arc::new(broker),
            plugins: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PluginId, LoadedPlugin>> {
        self.plugins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    pub fn broker(&self) -> &Arc<PermissionBroker> {
        &self.broker
    }

    /// Starts the background TTL sweep over the shared storage engine.
    pub fn spawn_sweeper(&self) -> Sweeper {
        Sweeper::spawn_configured(Arc::clone(&self.services.storage))
    }

    // ================================================================
    // Loading / Unloading
    // ================================================================

    /// Creates a sandbox instance for `manifest`.
    ///
    /// The initial grant set is the manifest's permissions followed by the
    /// host's `default_grants`.
    pub fn load(&self, manifest: PluginManifest) -> PluginHostResult<Arc<SandboxInstance>> {
        let mut plugins = self.lock();
        if let Some(existing) = plugins.get(&manifest.id) {
            if existing.instance.state() != SandboxState::Terminated {
                return Err(PluginHostError::PluginAlreadyLoaded(manifest.id.to_string()));
            }
            debug!(plugin_id = %manifest.id, "Replacing terminated instance");
        }

        let mut ledger =
            PermissionLedger::with_initial(manifest.permissions.iter().copied(), GrantSource::Manifest);
        for &capability in &self.config.permissions.default_grants {
            if !ledger.is_granted(capability) {
                ledger.grant(capability, GrantSource::HostDefault, None);
            }
        }

        let instance = Arc::new(SandboxInstance::new(
            manifest.id.clone(),
            runtime_for(manifest.runtime, &self.config.sandbox),
            Arc::clone(&self.services),
            Arc::clone(&self.broker),
            ledger,
            self.config.sandbox.execution_timeout(),
            self.config.sandbox.shutdown_grace(),
        ));

        info!(
            plugin_id = %manifest.id,
            runtime = %manifest.runtime,
            granted = ?instance.granted(),
            "Plugin loaded"
        );
        plugins.insert(
            manifest.id.clone(),
            LoadedPlugin {
                manifest,
                instance: Arc::clone(&instance),
            },
        );
        Ok(instance)
    }

    /// Runs the plugin's manifest source.
    pub async fn execute(&self, plugin_id: &PluginId) -> PluginHostResult<Value> {
        let (instance, source) = {
            let plugins = self.lock();
            let loaded = plugins
                .get(plugin_id)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
            (Arc::clone(&loaded.instance), loaded.manifest.source.clone())
        };
        instance.execute(&source).await
    }

    /// Terminates and removes the plugin, dropping its UI commands, chat
    /// hooks and cached storage namespace.
    pub async fn unload(&self, plugin_id: &PluginId) -> PluginHostResult<()> {
        let loaded = self
            .lock()
            .remove(plugin_id)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
        loaded.instance.unload().await;

        let commands = self.services.commands.unregister_plugin(plugin_id);
        let hooks = self.services.chat_hooks.unregister_plugin(plugin_id);
        self.services.storage.evict(plugin_id);
        info!(plugin_id = %plugin_id, commands, hooks, "Plugin unloaded");
        Ok(())
    }

    /// Unloads every plugin.
    pub async fn shutdown(&self) {
        let ids: Vec<PluginId> = self.lock().keys().cloned().collect();
        for id in ids {
            // Only fails if a concurrent unload got there first.
            let _ = self.unload(&id).await;
        }
        info!("Plugin host shut down");
    }

    // ================================================================
    // Plugin access
    // ================================================================

    pub fn instance(&self, plugin_id: &PluginId) -> PluginHostResult<Arc<SandboxInstance>> {
        self.lock()
            .get(plugin_id)
            .map(|loaded| Arc::clone(&loaded.instance))
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))
    }

    pub fn manifest(&self, plugin_id: &PluginId) -> PluginHostResult<PluginManifest> {
        self.lock()
            .get(plugin_id)
            .map(|loaded| loaded.manifest.clone())
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))
    }

    /// Loaded plugin ids, sorted.
    pub fn loaded(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_loaded(&self, plugin_id: &PluginId) -> bool {
        self.lock().contains_key(plugin_id)
    }

    pub fn plugin_count(&self) -> usize {
        self.lock().len()
    }
}
