//! Host-side UI surface: notifications and the command palette registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use warden_types::PluginId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

/// Presents plugin notifications to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, plugin_id: &PluginId, notification: &Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, plugin_id: &PluginId, notification: &Notification) {
        info!(
            plugin_id = %plugin_id,
            title = %notification.title,
            body = notification.body.as_deref().unwrap_or(""),
            "Plugin notification"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredCommand {
    /// `<pluginId>.<commandId>`
    pub qualified_id: String,
    pub plugin_id: PluginId,
    pub command_id: String,
    pub title: String,
}

/// Commands registered by plugins, keyed by qualified id.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: Mutex<BTreeMap<String, RegisteredCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, RegisteredCommand>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers (or re-registers) a command and returns its qualified id.
    pub fn register(&self, plugin_id: &PluginId, command_id: &str, title: &str) -> String {
        let qualified_id = format!("{plugin_id}.{command_id}");
        let command = RegisteredCommand {
            qualified_id: qualified_id.clone(),
            plugin_id: plugin_id.clone(),
            command_id: command_id.to_string(),
            title: title.to_string(),
        };
        self.lock().insert(qualified_id.clone(), command);
        debug!(plugin_id = %plugin_id, command = %qualified_id, "Registered command");
        qualified_id
    }

    /// Drops every command owned by `plugin_id`. Returns how many were removed.
    pub fn unregister_plugin(&self, plugin_id: &PluginId) -> usize {
        let mut commands = self.lock();
        let before = commands.len();
        commands.retain(|_, c| &c.plugin_id != plugin_id);
        before - commands.len()
    }

    pub fn get(&self, qualified_id: &str) -> Option<RegisteredCommand> {
        self.lock().get(qualified_id).cloned()
    }

    pub fn list(&self) -> Vec<RegisteredCommand> {
        self.lock().values().cloned().collect()
    }
}
