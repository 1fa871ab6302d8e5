//! Pending-call registry.
//!
//! Maps a call id to its outstanding record. Ids are monotonic and never
//! reused; a record leaves the registry exactly once, either through
//! [`PendingCalls::resolve`] when its reply arrives or through
//! [`PendingCalls::drain_all`] on teardown.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::CallResult;

/// Where a resolved call's result goes.
///
/// Callers hold the receiving half of a oneshot; engine-internal calls carry
/// a tag the demux loop matches on inline.
#[derive(Debug)]
pub enum CallSink<T> {
    Caller(oneshot::Sender<CallResult>),
    Internal(T),
}

/// One outstanding call.
#[derive(Debug)]
pub struct CallRecord<T> {
    pub id: u64,
    pub namespace: String,
    pub method: String,
    pub sink: CallSink<T>,
}

/// Registry of outstanding calls keyed by id.
#[derive(Debug)]
pub struct PendingCalls<T> {
    next_id: u64,
    max_pending: usize,
    calls: HashMap<u64, CallRecord<T>>,
}

impl<T> PendingCalls<T> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_id: 0,
            max_pending,
            calls: HashMap::new(),
        }
    }

    /// True when no further call can be registered.
    ///
    /// Checked by the caller under the same lock that guards `register`, so
    /// the capacity decision and the registration are one atomic step.
    pub fn is_full(&self) -> bool {
        self.calls.len() >= self.max_pending
    }

    /// Allocate the next id and store the record. The id goes into the
    /// outgoing frame; the registry keeps the sink until resolution.
    pub fn register(&mut self, namespace: &str, method: &str, sink: CallSink<T>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.calls.insert(
            id,
            CallRecord {
                id,
                namespace: namespace.to_owned(),
                method: method.to_owned(),
                sink,
            },
        );
        tracing::debug!(
            id,
            namespace,
            method,
            outstanding = self.calls.len(),
            "registered pending call"
        );
        id
    }

    /// Remove and return the record for `id`.
    ///
    /// `None` means the id is unknown — a reply to an already-resolved call,
    /// which the caller tolerates rather than treats as fatal.
    pub fn resolve(&mut self, id: u64) -> Option<CallRecord<T>> {
        self.calls.remove(&id)
    }

    /// Remove every outstanding record. The caller completes each one with a
    /// connection-lost result; nothing is silently dropped.
    pub fn drain_all(&mut self) -> Vec<CallRecord<T>> {
        let drained: Vec<_> = self.calls.drain().map(|(_, record)| record).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "draining outstanding calls");
        }
        drained
    }

    pub fn outstanding(&self) -> usize {
        self.calls.len()
    }

    /// Sorted ids of outstanding calls (diagnostics).
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.calls.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallError;

    fn caller_sink() -> (CallSink<()>, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        (CallSink::Caller(tx), rx)
    }

    #[test]
    fn ids_are_monotonic_and_unique_while_outstanding() {
        let mut pending: PendingCalls<()> = PendingCalls::new(16);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let (sink, _rx) = caller_sink();
            ids.push(pending.register("Devices", "List", sink));
        }
        for window in ids.windows(2) {
            assert!(window[0] < window[1]);
        }
        assert_eq!(pending.ids(), ids);
    }

    #[test]
    fn resolve_removes_the_record() {
        let mut pending: PendingCalls<()> = PendingCalls::new(16);
        let (sink, _rx) = caller_sink();
        let id = pending.register("Devices", "List", sink);

        let record = pending.resolve(id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.namespace, "Devices");
        assert_eq!(record.method, "List");

        assert!(pending.resolve(id).is_none());
        assert_eq!(pending.outstanding(), 0);
    }

    #[test]
    fn unknown_id_is_tolerated() {
        let mut pending: PendingCalls<()> = PendingCalls::new(16);
        assert!(pending.resolve(42).is_none());
    }

    #[tokio::test]
    async fn drain_all_reaches_every_caller() {
        let mut pending: PendingCalls<()> = PendingCalls::new(16);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (sink, rx) = caller_sink();
            pending.register("Devices", "List", sink);
            receivers.push(rx);
        }

        for record in pending.drain_all() {
            if let CallSink::Caller(tx) = record.sink {
                let _ = tx.send(Err(CallError::ConnectionLost));
            }
        }
        assert_eq!(pending.outstanding(), 0);

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(CallError::ConnectionLost));
        }
    }

    #[test]
    fn capacity_is_enforced_by_is_full() {
        let mut pending: PendingCalls<()> = PendingCalls::new(2);
        for _ in 0..2 {
            let (sink, _rx) = caller_sink();
            assert!(!pending.is_full());
            pending.register("Devices", "List", sink);
        }
        assert!(pending.is_full());

        let id = pending.ids()[0];
        pending.resolve(id);
        assert!(!pending.is_full());
    }
}
