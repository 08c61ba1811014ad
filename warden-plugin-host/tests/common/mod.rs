//! Shared fixtures for plugin host integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use warden_plugin_host::{
    ConsentProvider, FetchRequest, FetchResponse, HostConfig, HostServices, HttpFetcher,
    NetworkPolicy, Notification, Notifier, PluginHostManager, PluginId, PluginManifest,
    RuntimeKind,
};
use warden_storage::{StorageConfig, StorageEngine};

pub fn pid(id: &str) -> PluginId {
    PluginId::new(id).unwrap()
}

pub fn config() -> HostConfig {
    let mut config = HostConfig::default();
    config.sandbox.execution_timeout_ms = 5_000;
    config.sandbox.shutdown_grace_ms = 1_000;
    config.network.allowed_hosts = vec!["api.example.com".into(), "*.cdn.example.com".into()];
    config
}

pub fn script(id: &str, source: &str) -> PluginManifest {
    PluginManifest::new(pid(id), RuntimeKind::Script, source)
}

/// Records requests and answers with a fixed JSON body.
#[derive(Default)]
pub struct MockFetcher {
    pub requests: Mutex<Vec<FetchRequest>>,
    pub fail: bool,
}

impl MockFetcher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        self.requests.lock().unwrap().push(request);
        if self.fail {
            anyhow::bail!("connection refused");
        }
        Ok(FetchResponse {
            status: 200,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: r#"{"ok":true}"#.to_string(),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub shown: Mutex<Vec<(PluginId, Notification)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, plugin_id: &PluginId, notification: &Notification) {
        self.shown
            .lock()
            .unwrap()
            .push((plugin_id.clone(), notification.clone()));
    }
}

pub struct Host {
    pub manager: PluginHostManager,
    pub fetcher: Arc<MockFetcher>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn host(config: HostConfig, consent: Arc<dyn ConsentProvider>) -> Host {
    host_with(config, consent, MockFetcher::default())
}

pub fn host_with(config: HostConfig, consent: Arc<dyn ConsentProvider>, fetcher: MockFetcher) -> Host {
    let storage = Arc::new(StorageEngine::in_memory(config.storage.clone()));
    let fetcher = Arc::new(fetcher);
    let notifier = Arc::new(RecordingNotifier::default());
    let services = HostServices::new(
        storage,
        NetworkPolicy::from_config(&config.network),
        fetcher.clone(),
    )
    .with_notifier(notifier.clone());
    Host {
        manager: PluginHostManager::with_services(config, services, consent),
        fetcher,
        notifier,
    }
}

pub fn small_storage() -> StorageConfig {
    StorageConfig {
        max_keys: 2,
        ..StorageConfig::default()
    }
}
