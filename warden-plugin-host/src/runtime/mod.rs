//! Isolation runtimes.
//!
//! An [`IsolationRuntime`] creates one [`GuestContext`] per execution. A
//! context runs on its own OS thread and its only route to the host is
//! the [`ApiProxy`] it is handed; it has no file, network or process
//! primitives of its own.

mod script;
mod wasm;

pub use script::ScriptRuntime;
pub use wasm::WasmRuntime;

use crate::config::SandboxConfig;
use crate::error::PluginHostResult;
use crate::message::{ErrorCode, ErrorPayload, Message};
use crate::proxy::ApiProxy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use warden_types::PluginId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Script,
    Wasm,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Wasm => "wasm",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(Self::Script),
            "wasm" => Ok(Self::Wasm),
            other => Err(format!("unknown runtime '{other}' (expected script or wasm)")),
        }
    }
}

/// Why guest code stopped without producing a value.
#[derive(Debug, Error)]
pub enum GuestFault {
    /// A host call failed and the guest did not handle the error.
    #[error("uncaught {0}")]
    Uncaught(ErrorPayload),

    /// The guest raised an error of its own (including malformed code).
    #[error("{0}")]
    Raised(String),

    #[error("trap: {0}")]
    Trap(String),

    #[error("interrupted by host")]
    Interrupted,

    #[error("host channel closed")]
    Disconnected,
}

impl GuestFault {
    /// The `error` payload reported to the host for this fault.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Uncaught(cause) => ErrorPayload::new(ErrorCode::SandboxFaulted, self.to_string())
                .with_detail(serde_json::to_value(cause).unwrap_or(Value::Null)),
            Self::Interrupted | Self::Disconnected => {
                ErrorPayload::new(ErrorCode::Terminated, self.to_string())
            }
            Self::Raised(_) | Self::Trap(_) => {
                ErrorPayload::new(ErrorCode::SandboxFaulted, self.to_string())
            }
        }
    }
}

/// Stops a running guest unconditionally.
///
/// Sets the cancel flag every blocking proxy operation polls, and for wasm
/// guests bumps the engine epoch so running guest code traps.
#[derive(Clone, Default)]
pub struct Interrupter {
    flag: Arc<AtomicBool>,
    engine: Option<wasmtime::Engine>,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_engine(engine: wasmtime::Engine) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            engine: Some(engine),
        }
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(engine) = &self.engine {
            engine.increment_epoch();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("interrupted", &self.is_interrupted())
            .field("epoch", &self.engine.is_some())
            .finish()
    }
}

/// One isolated execution of plugin code.
pub trait GuestContext: Send {
    fn interrupter(&self) -> Interrupter;

    /// Runs `code` to completion. Blocks the calling thread.
    fn run(self: Box<Self>, code: &str, proxy: ApiProxy) -> Result<Value, GuestFault>;
}

pub trait IsolationRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn create_context(&self, plugin_id: &PluginId) -> PluginHostResult<Box<dyn GuestContext>>;
}

/// Builds the runtime for `kind`.
pub fn runtime_for(kind: RuntimeKind, config: &SandboxConfig) -> Arc<dyn IsolationRuntime> {
    match kind {
        RuntimeKind::Script => Arc::new(ScriptRuntime::new()),
        RuntimeKind::Wasm => Arc::new(WasmRuntime::new(config.max_memory_bytes)),
    }
}

/// Starts `context` on a dedicated thread.
///
/// The thread waits for the `execute` message, runs the code and answers
/// it with a `response` or `error` carrying the execute id. Panics inside
/// the context become `sandbox-faulted` errors. `exited` is dropped when
/// the thread finishes.
pub(crate) fn spawn_guest(
    plugin_id: &PluginId,
    context: Box<dyn GuestContext>,
    mut proxy: ApiProxy,
    exited: oneshot::Sender<()>,
) -> std::io::Result<()> {
    let name = format!("warden-guest-{plugin_id}");
    let plugin_id = plugin_id.clone();
    std::thread::Builder::new().name(name).spawn(move || {
        let _exited = exited;
        let (execute_id, execute) = match proxy.receive_execute() {
            Ok(received) => received,
            Err(fault) => {
                debug!(plugin_id = %plugin_id, %fault, "Guest stopped before execute");
                return;
            }
        };
        let to_host = proxy.host_sender();

        let outcome = catch_unwind(AssertUnwindSafe(move || context.run(&execute.code, proxy)));
        let reply = match outcome {
            Ok(Ok(value)) => Message::response(execute_id, value),
            Ok(Err(fault)) => Message::error(execute_id, &fault.to_payload()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(plugin_id = %plugin_id, panic = %message, "Guest context panicked");
                Message::error(
                    execute_id,
                    &ErrorPayload::new(ErrorCode::SandboxFaulted, format!("guest panicked: {message}")),
                )
            }
        };
        if to_host.send(reply).is_err() {
            debug!(plugin_id = %plugin_id, "Host gone before guest finished");
        }
    })?;
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_parses() {
        assert_eq!("wasm".parse::<RuntimeKind>().unwrap(), RuntimeKind::Wasm);
        assert_eq!(RuntimeKind::default(), RuntimeKind::Script);
        assert!("js".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn interrupter_clones_share_flag() {
        let a = Interrupter::new();
        let b = a.clone();
        b.interrupt();
        assert!(a.is_interrupted());
    }

    #[test]
    fn uncaught_fault_keeps_cause_as_detail() {
        let cause = ErrorPayload::new(ErrorCode::PermissionDenied, "no network");
        let payload = GuestFault::Uncaught(cause.clone()).to_payload();
        assert_eq!(payload.code, ErrorCode::SandboxFaulted);
        let detail: ErrorPayload = serde_json::from_value(payload.detail.unwrap()).unwrap();
        assert_eq!(detail, cause);
    }

    #[test]
    fn interruption_reports_terminated() {
        assert_eq!(GuestFault::Interrupted.to_payload().code, ErrorCode::Terminated);
    }
}
