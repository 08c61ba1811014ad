//! Chat integration: hook registration and outbound messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};
use warden_types::{CorrelationId, PluginId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    /// Fires for each incoming user message.
    Message,
    /// Fires for each assistant response.
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHook {
    pub id: CorrelationId,
    pub plugin_id: PluginId,
    pub kind: HookKind,
    /// Plugin-chosen handler name the chat host invokes.
    pub handler: String,
}

#[derive(Debug, Default)]
pub struct ChatHooks {
    hooks: Mutex<Vec<ChatHook>>,
}

impl ChatHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChatHook>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, plugin_id: &PluginId, kind: HookKind, handler: &str) -> CorrelationId {
        let hook = ChatHook {
            id: CorrelationId::new(),
            plugin_id: plugin_id.clone(),
            kind,
            handler: handler.to_string(),
        };
        let id = hook.id;
        self.lock().push(hook);
        id
    }

    pub fn hooks_for(&self, kind: HookKind) -> Vec<ChatHook> {
        self.lock().iter().filter(|h| h.kind == kind).cloned().collect()
    }

    pub fn unregister_plugin(&self, plugin_id: &PluginId) -> usize {
        let mut hooks = self.lock();
        let before = hooks.len();
        hooks.retain(|h| &h.plugin_id != plugin_id);
        before - hooks.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Delivers `chat.sendMessage` calls to the chat host.
#[async_trait]
pub trait ChatBridge: Send + Sync {
    async fn send_message(&self, plugin_id: &PluginId, message: Value) -> anyhow::Result<Value>;
}

/// Bridge used when no chat host is attached.
#[derive(Debug, Default)]
pub struct UnavailableChatBridge;

#[async_trait]
impl ChatBridge for UnavailableChatBridge {
    async fn send_message(&self, _plugin_id: &PluginId, _message: Value) -> anyhow::Result<Value> {
        anyhow::bail!("no chat host is attached")
    }
}
