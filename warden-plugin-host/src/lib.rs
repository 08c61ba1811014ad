//! Sandboxed plugin host for warden.
//!
//! Runs untrusted plugin code inside an isolation context that can only
//! reach the host through a correlation-id message channel. Every
//! capability call is checked against the plugin's grant ledger, and
//! ungranted capabilities go through the consent broker first.
//!
//! Each execution gets a fresh context on its own OS thread; the host
//! side is an async task that owns the timeout and termination.

mod api;
mod broker;
mod capability;
mod chat;
mod config;
mod error;
mod manager;
mod message;
mod network;
mod permissions;
mod proxy;
mod rpc;
pub mod runtime;
mod sandbox;
mod ui;

pub use api::{ApiCall, HostServices, Method};
pub use broker::{
    ChannelConsent, ConsentPrompt, ConsentProvider, PermissionBroker, PermissionRequest,
    StaticConsent,
};
pub use capability::Capability;
pub use chat::{ChatBridge, ChatHook, ChatHooks, HookKind, UnavailableChatBridge};
pub use config::{HostConfig, NetworkConfig, PermissionConfig, SandboxConfig};
pub use error::{PluginHostError, PluginHostResult};
pub use manager::{PluginHostManager, PluginManifest};
pub use message::{
    ApiCallPayload, ErrorCode, ErrorPayload, ExecutePayload, Message, MessageType,
    PermissionRequestPayload,
};
pub use network::{FetchRequest, FetchResponse, HttpFetcher, NetworkPolicy, ReqwestFetcher};
pub use permissions::{Decision, GrantEvent, GrantSource, PermissionLedger};
pub use proxy::{ApiProxy, CallResult};
pub use rpc::RpcBroker;
pub use runtime::{GuestContext, GuestFault, Interrupter, IsolationRuntime, RuntimeKind};
pub use sandbox::{SandboxInstance, SandboxState};
pub use ui::{CommandRegistry, Notification, Notifier, RegisteredCommand, TracingNotifier};

pub use warden_types::{CorrelationId, PluginId};
