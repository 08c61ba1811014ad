//! Correlation-id request/response broker.
//!
//! A map from correlation id to a one-shot completion handle, independent
//! of the transport carrying the messages. Used on both sides of the
//! isolation boundary.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;
use warden_types::CorrelationId;

pub struct RpcBroker<T> {
    pending: Mutex<HashMap<CorrelationId, oneshot::Sender<T>>>,
}

impl<T> Default for RpcBroker<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RpcBroker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<T>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh id and returns it with the receiver for its reply.
    pub fn register(&self) -> (CorrelationId, oneshot::Receiver<T>) {
        let id = CorrelationId::new();
        (id, self.register_with(id))
    }

    /// Registers an id chosen by the caller. A previous registration under
    /// the same id is replaced and its receiver sees a closed channel.
    pub fn register_with(&self, id: CorrelationId) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Delivers `value` to the waiter for `id`. Each id completes at most
    /// once; returns `false` (and drops the value) when the id is unknown.
    pub fn complete(&self, id: CorrelationId, value: T) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            debug!(correlation_id = %id, "Discarding reply for unknown correlation id");
            return false;
        };
        // The waiter may have gone away; that is not an error for the sender.
        let _ = tx.send(value);
        true
    }

    /// Forgets `id` without completing it.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Completes every outstanding id with the value produced by `reject`.
    /// Returns the ids that were rejected.
    pub fn reject_all(&self, reject: impl Fn(CorrelationId) -> T) -> Vec<CorrelationId> {
        let drained: Vec<_> = self.lock().drain().collect();
        drained
            .into_iter()
            .map(|(id, tx)| {
                let _ = tx.send(reject(id));
                id
            })
            .collect()
    }

    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_delivers_once() {
        let broker = RpcBroker::new();
        let (id, mut rx) = broker.register();
        assert!(broker.is_pending(id));
        assert!(broker.complete(id, 7));
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(!broker.complete(id, 8));
        assert_eq!(broker.pending_count(), 0);
    }

    #[test]
    fn unknown_id_is_discarded() {
        let broker: RpcBroker<u8> = RpcBroker::new();
        assert!(!broker.complete(CorrelationId::new(), 1));
    }

    #[test]
    fn reject_all_drains_every_waiter() {
        let broker = RpcBroker::new();
        let (a, mut rx_a) = broker.register();
        let (b, mut rx_b) = broker.register();
        let mut rejected = broker.reject_all(|_| "gone");
        rejected.sort_by_key(|id| id.as_uuid());
        let mut expected = vec![a, b];
        expected.sort_by_key(|id| id.as_uuid());
        assert_eq!(rejected, expected);
        assert_eq!(rx_a.try_recv().unwrap(), "gone");
        assert_eq!(rx_b.try_recv().unwrap(), "gone");
        assert_eq!(broker.pending_count(), 0);
    }

    #[test]
    fn cancel_closes_receiver() {
        let broker: RpcBroker<u8> = RpcBroker::new();
        let (id, mut rx) = broker.register();
        assert!(broker.cancel(id));
        assert!(rx.try_recv().is_err());
    }
}
