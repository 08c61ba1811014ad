//! The API proxy injected into an isolation context.
//!
//! This is the guest's only route to the host. Each call becomes an
//! `api-call` message with a fresh correlation id; the calling guest
//! thread is suspended until the matching reply arrives, the host goes
//! away, or the context is interrupted.

use crate::capability::Capability;
use crate::message::{
    ApiCallPayload, ErrorPayload, ExecutePayload, Message, MessageType, PermissionRequestPayload,
};
use crate::rpc::RpcBroker;
use crate::runtime::{GuestFault, Interrupter};
use serde_json::Value;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use warden_types::{CorrelationId, PluginId};

/// How often a blocked guest re-checks for interruption.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one host call as seen by the guest.
pub type CallResult = Result<Value, ErrorPayload>;

pub struct ApiProxy {
    plugin_id: PluginId,
    to_host: mpsc::UnboundedSender<Message>,
    from_host: Receiver<Message>,
    pending: RpcBroker<Message>,
    interrupter: Interrupter,
    granted: Vec<Capability>,
}

impl ApiProxy {
    pub(crate) fn new(
        plugin_id: PluginId,
        to_host: mpsc::UnboundedSender<Message>,
        from_host: Receiver<Message>,
        interrupter: Interrupter,
    ) -> Self {
        Self {
            plugin_id,
            to_host,
            from_host,
            pending: RpcBroker::new(),
            interrupter,
            granted: Vec::new(),
        }
    }

    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// Capabilities granted when the execution started.
    pub fn granted(&self) -> &[Capability] {
        &self.granted
    }

    pub(crate) fn host_sender(&self) -> mpsc::UnboundedSender<Message> {
        self.to_host.clone()
    }

    /// Waits for the host's `execute` message.
    pub(crate) fn receive_execute(&mut self) -> Result<(CorrelationId, ExecutePayload), GuestFault> {
        loop {
            self.check_interrupted()?;
            match self.from_host.recv_timeout(POLL_INTERVAL) {
                Ok(msg) if msg.kind == MessageType::Execute => {
                    let payload: ExecutePayload = msg
                        .payload_as()
                        .map_err(|e| GuestFault::Raised(format!("malformed execute message: {e}")))?;
                    self.granted = payload.permissions.clone();
                    return Ok((msg.id, payload));
                }
                Ok(msg) => {
                    debug!(plugin_id = %self.plugin_id, kind = ?msg.kind, "Ignoring message before execute");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(self.closed()),
            }
        }
    }

    /// Invokes a host capability method.
    ///
    /// The outer `Err` means the context must stop; the inner result is the
    /// host's answer, which guest code may handle.
    pub fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        reason: Option<String>,
    ) -> Result<CallResult, GuestFault> {
        let msg = Message::api_call(&ApiCallPayload {
            method: method.to_string(),
            args,
            reason,
        })
        .map_err(|e| GuestFault::Raised(format!("unserializable call arguments: {e}")))?;
        Ok(self.send_request(msg)?.into_reply())
    }

    /// Asks the host to grant `capability` ahead of use.
    pub fn request_permission(
        &mut self,
        capability: Capability,
        reason: &str,
    ) -> Result<bool, GuestFault> {
        let msg = Message::permission_request(&PermissionRequestPayload {
            capability,
            reason: reason.to_string(),
        })
        .map_err(|e| GuestFault::Raised(e.to_string()))?;
        let granted = match self.send_request(msg)?.into_reply() {
            Ok(reply) => reply.get("granted").and_then(Value::as_bool).unwrap_or(false),
            Err(_) => false,
        };
        if granted && !self.granted.contains(&capability) {
            self.granted.push(capability);
        }
        Ok(granted)
    }

    /// Sleeps for `duration`, waking early if interrupted.
    pub fn pause(&self, duration: Duration) -> Result<(), GuestFault> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_interrupted()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }

    pub fn check_interrupted(&self) -> Result<(), GuestFault> {
        if self.interrupter.is_interrupted() {
            Err(GuestFault::Interrupted)
        } else {
            Ok(())
        }
    }

    fn send_request(&mut self, msg: Message) -> Result<Message, GuestFault> {
        let id = msg.id;
        let reply = self.pending.register_with(id);
        if self.to_host.send(msg).is_err() {
            self.pending.cancel(id);
            return Err(self.closed());
        }
        self.await_reply(id, reply)
    }

    fn await_reply(
        &mut self,
        id: CorrelationId,
        mut reply: oneshot::Receiver<Message>,
    ) -> Result<Message, GuestFault> {
        loop {
            match reply.try_recv() {
                Ok(msg) => return Ok(msg),
                Err(oneshot::error::TryRecvError::Closed) => return Err(self.closed()),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            if let Err(fault) = self.check_interrupted() {
                self.pending.cancel(id);
                return Err(fault);
            }
            match self.from_host.recv_timeout(POLL_INTERVAL) {
                Ok(msg) if msg.is_reply() => {
                    self.pending.complete(msg.id, msg);
                }
                Ok(msg) => {
                    debug!(plugin_id = %self.plugin_id, kind = ?msg.kind, "Ignoring unexpected host message");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.pending.cancel(id);
                    return Err(self.closed());
                }
            }
        }
    }

    fn closed(&self) -> GuestFault {
        if self.interrupter.is_interrupted() {
            GuestFault::Interrupted
        } else {
            GuestFault::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;

    struct Harness {
        proxy: ApiProxy,
        host_rx: mpsc::UnboundedReceiver<Message>,
        host_tx: std_mpsc::Sender<Message>,
        interrupter: Interrupter,
    }

    fn harness() -> Harness {
        let (to_host, host_rx) = mpsc::unbounded_channel();
        let (host_tx, from_host) = std_mpsc::channel();
        let interrupter = Interrupter::new();
        let proxy = ApiProxy::new(
            PluginId::new("proxy.test").unwrap(),
            to_host,
            from_host,
            interrupter.clone(),
        );
        Harness {
            proxy,
            host_rx,
            host_tx,
            interrupter,
        }
    }

    #[test]
    fn call_returns_correlated_reply() {
        let Harness {
            mut proxy,
            mut host_rx,
            host_tx,
            ..
        } = harness();
        let host = std::thread::spawn(move || {
            let request = host_rx.blocking_recv().unwrap();
            assert_eq!(request.kind, MessageType::ApiCall);
            // A stray reply for an id nobody asked for is discarded.
            host_tx
                .send(Message::response(CorrelationId::new(), json!("stray")))
                .unwrap();
            host_tx.send(Message::response(request.id, json!(42))).unwrap();
        });
        let result = proxy.call("storage.get", vec![json!("k")], None).unwrap();
        assert_eq!(result, Ok(json!(42)));
        host.join().unwrap();
    }

    #[test]
    fn error_reply_is_inner_error() {
        let Harness {
            mut proxy,
            mut host_rx,
            host_tx,
            ..
        } = harness();
        let host = std::thread::spawn(move || {
            let request = host_rx.blocking_recv().unwrap();
            let err = ErrorPayload::new(ErrorCode::PermissionDenied, "denied");
            host_tx.send(Message::error(request.id, &err)).unwrap();
        });
        let err = proxy.call("network.fetch", vec![], None).unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        host.join().unwrap();
    }

    #[test]
    fn interruption_unblocks_waiting_call() {
        let Harness {
            mut proxy,
            host_rx,
            host_tx,
            interrupter,
        } = harness();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            interrupter.interrupt();
        });
        let fault = proxy.call("storage.get", vec![], None).unwrap_err();
        assert!(matches!(fault, GuestFault::Interrupted));
        stopper.join().unwrap();
        drop((host_rx, host_tx));
    }

    #[test]
    fn closed_host_channel_is_disconnect() {
        let Harness {
            mut proxy, host_rx, host_tx, ..
        } = harness();
        drop(host_tx);
        let fault = proxy.call("logger.log", vec![], None).unwrap_err();
        assert!(matches!(fault, GuestFault::Disconnected));
        drop(host_rx);
    }

    #[test]
    fn pause_stops_on_interrupt() {
        let h = harness();
        h.interrupter.interrupt();
        assert!(matches!(
            h.proxy.pause(Duration::from_secs(5)),
            Err(GuestFault::Interrupted)
        ));
    }
}
