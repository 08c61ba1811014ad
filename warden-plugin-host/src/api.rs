//! Capability API surface: the fixed table of host methods a plugin may call.
//!
//! Handlers run on the host. They assume the permission check already
//! happened; see [`crate::PermissionBroker`].

use crate::capability::Capability;
use crate::chat::{ChatBridge, ChatHooks, HookKind, UnavailableChatBridge};
use crate::message::{ErrorCode, ErrorPayload};
use crate::network::{FetchInit, FetchRequest, HttpFetcher, NetworkPolicy};
use crate::ui::{CommandRegistry, Notification, Notifier, TracingNotifier};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use warden_storage::{PutOptions, StorageEngine};
use warden_types::PluginId;

/// Every host method, one per `(capability, operation)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    StorageGet,
    StorageSet,
    StorageRemove,
    StorageKeys,
    StorageFindByTags,
    StorageQuota,
    LoggerLog,
    LoggerWarn,
    LoggerError,
    UiShowNotification,
    UiRegisterCommand,
    ChatOnMessage,
    ChatOnResponse,
    ChatSendMessage,
    NetworkFetch,
}

impl Method {
    pub const ALL: [Method; 15] = [
        Self::StorageGet,
        Self::StorageSet,
        Self::StorageRemove,
        Self::StorageKeys,
        Self::StorageFindByTags,
        Self::StorageQuota,
        Self::LoggerLog,
        Self::LoggerWarn,
        Self::LoggerError,
        Self::UiShowNotification,
        Self::UiRegisterCommand,
        Self::ChatOnMessage,
        Self::ChatOnResponse,
        Self::ChatSendMessage,
        Self::NetworkFetch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::StorageGet => "storage.get",
            Self::StorageSet => "storage.set",
            Self::StorageRemove => "storage.remove",
            Self::StorageKeys => "storage.keys",
            Self::StorageFindByTags => "storage.findByTags",
            Self::StorageQuota => "storage.quota",
            Self::LoggerLog => "logger.log",
            Self::LoggerWarn => "logger.warn",
            Self::LoggerError => "logger.error",
            Self::UiShowNotification => "ui.showNotification",
            Self::UiRegisterCommand => "ui.registerCommand",
            Self::ChatOnMessage => "chat.onMessage",
            Self::ChatOnResponse => "chat.onResponse",
            Self::ChatSendMessage => "chat.sendMessage",
            Self::NetworkFetch => "network.fetch",
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            Self::StorageGet
            | Self::StorageSet
            | Self::StorageRemove
            | Self::StorageKeys
            | Self::StorageFindByTags
            | Self::StorageQuota => Capability::Storage,
            Self::LoggerLog | Self::LoggerWarn | Self::LoggerError => Capability::Logger,
            Self::UiShowNotification | Self::UiRegisterCommand => Capability::Ui,
            Self::ChatOnMessage | Self::ChatOnResponse | Self::ChatSendMessage => Capability::Chat,
            Self::NetworkFetch => Capability::Network,
        }
    }
}

impl FromStr for Method {
    type Err = ErrorPayload;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| {
                ErrorPayload::new(ErrorCode::UnknownMethod, format!("unknown method '{s}'"))
                    .with_detail(json!({ "method": s }))
            })
    }
}

/// A decoded `api-call`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub method: Method,
    pub args: Vec<Value>,
    pub reason: Option<String>,
}

impl ApiCall {
    fn arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, ErrorPayload> {
        let value = self.args.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            ErrorPayload::invalid_arguments(format!(
                "{}: argument {} ('{name}'): {e}",
                self.method.name(),
                index + 1
            ))
        })
    }

    fn optional_arg<T: DeserializeOwned + Default>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<T, ErrorPayload> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(_) => self.arg(index, name),
        }
    }
}

/// Shared host collaborators the API handlers act on.
pub struct HostServices {
    pub storage: Arc<StorageEngine>,
    pub commands: Arc<CommandRegistry>,
    pub chat_hooks: Arc<ChatHooks>,
    pub chat_bridge: Arc<dyn ChatBridge>,
    pub notifier: Arc<dyn Notifier>,
    pub network: NetworkPolicy,
    pub fetcher: Arc<dyn HttpFetcher>,
}

impl HostServices {
    /// Services over `storage` with log-only notifications, no chat host
    /// and the given network policy and fetcher.
    pub fn new(
        storage: Arc<StorageEngine>,
        network: NetworkPolicy,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Self {
        Self {
            storage,
            commands: Arc::new(CommandRegistry::new()),
            chat_hooks: Arc::new(ChatHooks::new()),
            chat_bridge: Arc::new(UnavailableChatBridge),
            notifier: Arc::new(TracingNotifier),
            network,
            fetcher,
        }
    }

    pub fn with_chat_bridge(mut self, bridge: Arc<dyn ChatBridge>) -> Self {
        self.chat_bridge = bridge;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Runs one call for `plugin_id`.
    pub async fn dispatch(&self, plugin_id: &PluginId, call: &ApiCall) -> Result<Value, ErrorPayload> {
        match call.method.capability() {
            Capability::Storage => self.storage_call(plugin_id, call).await,
            Capability::Logger => self.logger_call(plugin_id, call),
            Capability::Ui => self.ui_call(plugin_id, call),
            Capability::Chat => self.chat_call(plugin_id, call).await,
            Capability::Network => self.network_call(plugin_id, call).await,
        }
    }

    async fn storage_call(&self, plugin_id: &PluginId, call: &ApiCall) -> Result<Value, ErrorPayload> {
        let storage = Arc::clone(&self.storage);
        let plugin_id = plugin_id.clone();
        let call = call.clone();
        tokio::task::spawn_blocking(move || storage_op(&storage, &plugin_id, &call))
            .await
            .map_err(|e| ErrorPayload::new(ErrorCode::StorageError, format!("storage task failed: {e}")))?
    }

    fn logger_call(&self, plugin_id: &PluginId, call: &ApiCall) -> Result<Value, ErrorPayload> {
        let message = match call.args.first() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let data = if call.args.len() > 1 {
            Value::Array(call.args[1..].to_vec())
        } else {
            Value::Null
        };
        match call.method {
            Method::LoggerWarn => {
                warn!(target: "plugin", plugin_id = %plugin_id, data = %data, "{}", message)
            }
            Method::LoggerError => {
                error!(target: "plugin", plugin_id = %plugin_id, data = %data, "{}", message)
            }
            _ => info!(target: "plugin", plugin_id = %plugin_id, data = %data, "{}", message),
        }
        Ok(Value::Null)
    }

    fn ui_call(&self, plugin_id: &PluginId, call: &ApiCall) -> Result<Value, ErrorPayload> {
        match call.method {
            Method::UiShowNotification => {
                let notification = match call.args.first() {
                    Some(Value::String(title)) => Notification {
                        title: title.clone(),
                        body: call.optional_arg::<Option<String>>(1, "body")?,
                    },
                    _ => call.arg::<Notification>(0, "notification")?,
                };
                self.notifier.notify(plugin_id, &notification);
                Ok(Value::Null)
            }
            _ => {
                let command_id: String = call.arg(0, "commandId")?;
                if command_id.is_empty() || command_id.contains(char::is_whitespace) {
                    return Err(ErrorPayload::invalid_arguments(format!(
                        "invalid command id '{command_id}'"
                    )));
                }
                let title: Option<String> = call.optional_arg(1, "title")?;
                let qualified = self.commands.register(
                    plugin_id,
                    &command_id,
                    title.as_deref().unwrap_or(&command_id),
                );
                Ok(Value::String(qualified))
            }
        }
    }

    async fn chat_call(&self, plugin_id: &PluginId, call: &ApiCall) -> Result<Value, ErrorPayload> {
        let kind = match call.method {
            Method::ChatOnMessage => HookKind::Message,
            Method::ChatOnResponse => HookKind::Response,
            _ => {
                let message = call.args.first().cloned().unwrap_or(Value::Null);
                return self
                    .chat_bridge
                    .send_message(plugin_id, message)
                    .await
                    .map_err(|e| ErrorPayload::new(ErrorCode::Unavailable, e.to_string()));
            }
        };
        let handler: String = call.arg(0, "handler")?;
        let id = self.chat_hooks.register(plugin_id, kind, &handler);
        Ok(json!(id))
    }

    async fn network_call(&self, plugin_id: &PluginId, call: &ApiCall) -> Result<Value, ErrorPayload> {
        let raw_url: String = call.arg(0, "url")?;
        let url = self.network.check(&raw_url).inspect_err(|e| {
            warn!(plugin_id = %plugin_id, url = %raw_url, "{}", e.message);
        })?;
        let init: FetchInit = call.optional_arg(1, "init")?;

        let request = FetchRequest {
            url,
            method: init.method.unwrap_or_else(|| "GET".to_string()),
            headers: init.headers,
            body: init.body,
        };
        let response = self.fetcher.fetch(request).await.map_err(|e| {
            ErrorPayload::new(ErrorCode::NetworkError, format!("fetch failed: {e:#}"))
                .with_detail(json!({ "url": raw_url }))
        })?;
        serde_json::to_value(response)
            .map_err(|e| ErrorPayload::new(ErrorCode::NetworkError, e.to_string()))
    }
}

fn storage_op(
    storage: &StorageEngine,
    plugin_id: &PluginId,
    call: &ApiCall,
) -> Result<Value, ErrorPayload> {
    let to_payload = |e: warden_storage::StorageError| ErrorPayload::from(&e);
    match call.method {
        Method::StorageGet => {
            let key: String = call.arg(0, "key")?;
            Ok(storage
                .get(plugin_id, &key)
                .map_err(to_payload)?
                .unwrap_or(Value::Null))
        }
        Method::StorageSet => {
            let key: String = call.arg(0, "key")?;
            let value = call.args.get(1).cloned().unwrap_or(Value::Null);
            let options: PutOptions = call.optional_arg(2, "options")?;
            let metadata = storage
                .put(plugin_id, &key, &value, &options)
                .map_err(to_payload)?;
            serde_json::to_value(metadata)
                .map_err(|e| ErrorPayload::new(ErrorCode::StorageError, e.to_string()))
        }
        Method::StorageRemove => {
            let key: String = call.arg(0, "key")?;
            Ok(Value::Bool(storage.remove(plugin_id, &key).map_err(to_payload)?))
        }
        Method::StorageKeys => Ok(json!(storage.list_keys(plugin_id).map_err(to_payload)?)),
        Method::StorageFindByTags => {
            let tags: Vec<String> = call.arg(0, "tags")?;
            Ok(json!(storage.find_by_tags(plugin_id, &tags).map_err(to_payload)?))
        }
        _ => {
            let quota = storage.get_quota(plugin_id).map_err(to_payload)?;
            serde_json::to_value(quota)
                .map_err(|e| ErrorPayload::new(ErrorCode::StorageError, e.to_string()))
        }
    }
}
