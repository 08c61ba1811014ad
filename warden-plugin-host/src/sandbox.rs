//! One loaded plugin: its isolation runtime, permission ledger and
//! execution state machine.
//!
//! ```text
//! Created --execute--> Executing --ok--> Ready --execute--> Executing
//!                          |
//!                          +--timeout / fault / unload--> Terminated
//! ```
//!
//! `Terminated` is final. The host drives each execution from an async
//! select loop: inbound guest messages are served on their own tasks so
//! a call waiting on a consent prompt never blocks the deadline.

use crate::api::{ApiCall, HostServices, Method};
use crate::broker::PermissionBroker;
use crate::capability::Capability;
use crate::error::{PluginHostError, PluginHostResult};
use crate::message::{
    ApiCallPayload, ErrorCode, ErrorPayload, ExecutePayload, Message, MessageType,
    PermissionRequestPayload,
};
use crate::permissions::{GrantEvent, PermissionLedger};
use crate::proxy::ApiProxy;
use crate::runtime::{GuestFault, Interrupter, IsolationRuntime, RuntimeKind, spawn_guest};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use warden_types::{CorrelationId, PluginId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxState {
    Created,
    Executing,
    Ready,
    Terminated,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Executing => "executing",
            Self::Ready => "ready",
            Self::Terminated => "terminated",
        })
    }
}

/// Handle on a running guest thread.
struct ActiveGuest {
    interrupter: Interrupter,
    exited: oneshot::Receiver<()>,
}

struct Inner {
    state: SandboxState,
    active: Option<ActiveGuest>,
}

/// Host ends of a started guest's message channels.
struct GuestLink {
    to_guest: std::sync::mpsc::Sender<Message>,
    from_guest: mpsc::UnboundedReceiver<Message>,
    execute_id: CorrelationId,
}

enum Outcome {
    Finished(Result<Value, ErrorPayload>),
    TimedOut,
    Unloaded,
}

pub struct SandboxInstance {
    plugin_id: PluginId,
    runtime: Arc<dyn IsolationRuntime>,
    services: Arc<HostServices>,
    broker: Arc<PermissionBroker>,
    ledger: Arc<Mutex<PermissionLedger>>,
    timeout: Duration,
    shutdown_grace: Duration,
    inner: Mutex<Inner>,
    unloaded: Notify,
}

impl SandboxInstance {
    pub fn new(
        plugin_id: PluginId,
        runtime: Arc<dyn IsolationRuntime>,
        services: Arc<HostServices>,
        broker: Arc<PermissionBroker>,
        ledger: PermissionLedger,
        timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            plugin_id,
            runtime,
            services,
            broker,
            ledger: Arc::new(Mutex::new(ledger)),
            timeout,
            shutdown_grace,
            inner: Mutex::new(Inner {
                state: SandboxState::Created,
                active: None,
            }),
            unloaded: Notify::new(),
        }
    }

    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    pub fn runtime_kind(&self) -> RuntimeKind {
        self.runtime.kind()
    }

    pub fn state(&self) -> SandboxState {
        self.lock().state
    }

    pub fn granted(&self) -> BTreeSet<Capability> {
        self.lock_ledger().granted()
    }

    /// Every grant and denial recorded for this plugin, oldest first.
    pub fn ledger_events(&self) -> Vec<GrantEvent> {
        self.lock_ledger().events().to_vec()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ledger(&self) -> MutexGuard<'_, PermissionLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn plugin_name(&self) -> String {
        self.plugin_id.to_string()
    }

    /// Runs `code` in a fresh isolation context.
    ///
    /// Fails with [`PluginHostError::ExecutionInProgress`] while another
    /// execution is running and with [`PluginHostError::Terminated`] once
    /// the instance is terminated.
    pub async fn execute(&self, code: &str) -> PluginHostResult<Value> {
        let previous = {
            let mut inner = self.lock();
            match inner.state {
                SandboxState::Executing => {
                    return Err(PluginHostError::ExecutionInProgress {
                        plugin_id: self.plugin_name(),
                    });
                }
                SandboxState::Terminated => {
                    return Err(PluginHostError::Terminated {
                        plugin_id: self.plugin_name(),
                    });
                }
                state => {
                    inner.state = SandboxState::Executing;
                    state
                }
            }
        };

        let link = match self.start_guest(code) {
            Ok(link) => link,
            Err(e) => {
                let mut inner = self.lock();
                inner.active = None;
                if inner.state == SandboxState::Executing {
                    inner.state = previous;
                }
                return Err(e);
            }
        };

        debug!(plugin_id = %self.plugin_id, runtime = %self.runtime.kind(), "Execution started");
        self.drive(link).await
    }

    /// Creates the context, starts its thread and hands it the `execute`
    /// message.
    fn start_guest(&self, code: &str) -> PluginHostResult<GuestLink> {
        let context = self.runtime.create_context(&self.plugin_id)?;
        let interrupter = context.interrupter();
        let (to_guest, from_host) = std::sync::mpsc::channel();
        let (to_host, from_guest) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        let proxy = ApiProxy::new(self.plugin_id.clone(), to_host, from_host, interrupter.clone());
        spawn_guest(&self.plugin_id, context, proxy, exited_tx).map_err(|e| {
            PluginHostError::ContextStart {
                plugin_id: self.plugin_name(),
                message: e.to_string(),
            }
        })?;
        self.lock().active = Some(ActiveGuest {
            interrupter,
            exited: exited_rx,
        });

        let execute = Message::execute(&ExecutePayload {
            code: code.to_string(),
            permissions: self.granted().into_iter().collect(),
            plugin_id: self.plugin_id.clone(),
        })?;
        let execute_id = execute.id;
        // A guest that already died shows up as a closed inbound channel.
        let _ = to_guest.send(execute);
        Ok(GuestLink {
            to_guest,
            from_guest,
            execute_id,
        })
    }

    async fn drive(&self, link: GuestLink) -> PluginHostResult<Value> {
        let GuestLink {
            to_guest,
            mut from_guest,
            execute_id,
        } = link;
        let (replies_tx, mut replies) = mpsc::unbounded_channel::<(CorrelationId, Message)>();
        let mut in_flight: HashMap<CorrelationId, AbortHandle> = HashMap::new();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => break Outcome::TimedOut,
                _ = self.unloaded.notified() => break Outcome::Unloaded,
                Some((id, reply)) = replies.recv() => {
                    if in_flight.remove(&id).is_some() {
                        let _ = to_guest.send(reply);
                    }
                }
                msg = from_guest.recv() => match msg {
                    None => break Outcome::Finished(Err(GuestFault::Disconnected.to_payload())),
                    Some(msg) => match msg.kind {
                        MessageType::ApiCall | MessageType::PermissionRequest => {
                            let id = msg.id;
                            let task = self.serve(msg, replies_tx.clone());
                            in_flight.insert(id, task);
                        }
                        MessageType::Response | MessageType::Error if msg.id == execute_id => {
                            break Outcome::Finished(msg.into_reply());
                        }
                        kind => {
                            debug!(plugin_id = %self.plugin_id, ?kind, "Ignoring unexpected guest message");
                        }
                    },
                },
            }
        };

        match outcome {
            Outcome::Finished(Ok(value)) => {
                abort_all(&mut in_flight);
                let mut inner = self.lock();
                inner.active = None;
                if inner.state == SandboxState::Executing {
                    inner.state = SandboxState::Ready;
                }
                debug!(plugin_id = %self.plugin_id, "Execution finished");
                Ok(value)
            }
            Outcome::Finished(Err(error)) => {
                let rejection = ErrorPayload::new(
                    ErrorCode::SandboxFaulted,
                    format!("sandbox faulted: {}", error.message),
                );
                let rejected_calls = reject_in_flight(&mut in_flight, &to_guest, &rejection);
                if self.state() == SandboxState::Terminated {
                    // Unloaded while the guest was already unwinding.
                    return Err(PluginHostError::Terminated {
                        plugin_id: self.plugin_name(),
                    });
                }
                let active = self.mark_terminated();
                self.reap(active).await;
                warn!(
                    plugin_id = %self.plugin_id,
                    code = %error.code,
                    rejected_calls,
                    "Sandbox faulted: {}",
                    error.message
                );
                let cause = error
                    .detail
                    .clone()
                    .and_then(|d| serde_json::from_value::<ErrorPayload>(d).ok());
                Err(PluginHostError::SandboxFaulted {
                    plugin_id: self.plugin_name(),
                    message: error.message,
                    cause,
                })
            }
            Outcome::TimedOut => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                let rejection = ErrorPayload::new(
                    ErrorCode::ExecutionTimeout,
                    format!("execution exceeded {timeout_ms}ms"),
                );
                let rejected_calls = reject_in_flight(&mut in_flight, &to_guest, &rejection);
                let active = self.mark_terminated();
                self.reap(active).await;
                warn!(
                    plugin_id = %self.plugin_id,
                    timeout_ms,
                    rejected_calls,
                    "Execution timed out, sandbox terminated"
                );
                Err(PluginHostError::ExecutionTimeout {
                    plugin_id: self.plugin_name(),
                    timeout_ms,
                    rejected_calls,
                })
            }
            Outcome::Unloaded => {
                let rejection = ErrorPayload::new(ErrorCode::Terminated, "plugin unloaded");
                let rejected = reject_in_flight(&mut in_flight, &to_guest, &rejection);
                debug!(plugin_id = %self.plugin_id, rejected, "Execution cut short by unload");
                Err(PluginHostError::Terminated {
                    plugin_id: self.plugin_name(),
                })
            }
        }
    }

    /// Serves one guest request on its own task.
    fn serve(&self, msg: Message, replies: mpsc::UnboundedSender<(CorrelationId, Message)>) -> AbortHandle {
        let services = Arc::clone(&self.services);
        let broker = Arc::clone(&self.broker);
        let ledger = Arc::clone(&self.ledger);
        let plugin_id = self.plugin_id.clone();

        let task = tokio::spawn(async move {
            let id = msg.id;
            let reply = match msg.kind {
                MessageType::PermissionRequest => {
                    let granted = match msg.payload_as::<PermissionRequestPayload>() {
                        Ok(request) => broker
                            .authorize(&plugin_id, &ledger, request.capability, Some(&request.reason))
                            .await
                            .is_ok(),
                        Err(e) => {
                            debug!(plugin_id = %plugin_id, error = %e, "Malformed permission request");
                            false
                        }
                    };
                    Message::response(id, json!({ "granted": granted }))
                }
                _ => match serve_call(&services, &broker, &ledger, &plugin_id, &msg).await {
                    Ok(value) => Message::response(id, value),
                    Err(error) => Message::error(id, &error),
                },
            };
            let _ = replies.send((id, reply));
        });
        task.abort_handle()
    }

    fn mark_terminated(&self) -> Option<ActiveGuest> {
        let mut inner = self.lock();
        inner.state = SandboxState::Terminated;
        inner.active.take()
    }

    /// Interrupts the guest thread and waits up to the shutdown grace
    /// period for it to exit.
    async fn reap(&self, active: Option<ActiveGuest>) {
        if let Some(active) = active {
            active.interrupter.interrupt();
            if tokio::time::timeout(self.shutdown_grace, active.exited).await.is_err() {
                warn!(
                    plugin_id = %self.plugin_id,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "Guest thread did not stop within grace period"
                );
            }
        }
    }

    /// Terminates the instance, interrupting any running execution.
    pub async fn unload(&self) {
        let active = self.mark_terminated();
        self.unloaded.notify_one();
        self.reap(active).await;
        info!(plugin_id = %self.plugin_id, "Sandbox unloaded");
    }
}

impl fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("plugin_id", &self.plugin_id)
            .field("runtime", &self.runtime.kind())
            .field("state", &self.state())
            .finish()
    }
}

async fn serve_call(
    services: &HostServices,
    broker: &PermissionBroker,
    ledger: &Mutex<PermissionLedger>,
    plugin_id: &PluginId,
    msg: &Message,
) -> Result<Value, ErrorPayload> {
    let payload: ApiCallPayload = msg
        .payload_as()
        .map_err(|e| ErrorPayload::invalid_arguments(format!("malformed api-call: {e}")))?;
    let method: Method = payload.method.parse()?;
    broker
        .authorize(plugin_id, ledger, method.capability(), payload.reason.as_deref())
        .await?;
    let call = ApiCall {
        method,
        args: payload.args,
        reason: payload.reason,
    };
    services.dispatch(plugin_id, &call).await
}

fn abort_all(in_flight: &mut HashMap<CorrelationId, AbortHandle>) {
    for (_, task) in in_flight.drain() {
        task.abort();
    }
}

/// Aborts every outstanding call and answers each with `rejection`.
fn reject_in_flight(
    in_flight: &mut HashMap<CorrelationId, AbortHandle>,
    to_guest: &std::sync::mpsc::Sender<Message>,
    rejection: &ErrorPayload,
) -> usize {
    let count = in_flight.len();
    for (id, task) in in_flight.drain() {
        task.abort();
        let _ = to_guest.send(Message::error(id, rejection));
    }
    count
}
