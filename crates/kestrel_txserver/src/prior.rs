//! Fan-out point for the log prior list.
//!
//! The log producer hands every prior-list chunk to the [`PriorSender`],
//! which invokes each registered sink exactly once per emission, in
//! registration order. Every connected page server registers one sink while
//! its connection is live, so one emission fans out to every replica in
//! parallel with the synchronous request traffic on the main connection.

use bytes::Bytes;
use kestrel_common::types::Lsa;

use crate::flush_gate::QuorumFlushGate;

/// A sink receiving prior-list emissions.
pub type SinkFn = Box<dyn Fn(&Bytes) + Send + Sync>;

/// Identity of a registered sink, used for idempotent removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

struct PriorInner {
    sinks: Vec<(SinkId, SinkFn)>,
    /// Position of the earliest log record not yet pushed to any sink, or
    /// null while the log subsystem has not been initialized.
    unsent_lsa: Lsa,
    next_id: u64,
}

/// See the module docs.
pub struct PriorSender {
    inner: parking_lot::Mutex<PriorInner>,
}

impl PriorSender {
    pub fn new() -> Self {
        PriorSender {
            inner: parking_lot::Mutex::new(PriorInner {
                sinks: Vec::new(),
                unsent_lsa: Lsa::NULL,
                next_id: 0,
            }),
        }
    }

    /// Register a sink. Returns its id and the position of the next record
    /// it will receive, or [`Lsa::NULL`] while the log subsystem is not yet
    /// initialized. The registration is atomic with respect to emissions:
    /// the sink sees everything sent from the returned position on.
    pub fn add_sink(&self, sink: SinkFn) -> (SinkId, Lsa) {
        let mut inner = self.inner.lock();
        let id = SinkId(inner.next_id);
        inner.next_id += 1;
        inner.sinks.push((id, sink));
        (id, inner.unsent_lsa)
    }

    /// Remove a sink. Idempotent; removing an unknown id is a no-op.
    pub fn remove_sink(&self, id: SinkId) {
        let mut inner = self.inner.lock();
        inner.sinks.retain(|(sink_id, _)| *sink_id != id);
    }

    /// Fan one prior-list emission out to every sink, in registration
    /// order. Emissions are opaque non-empty byte strings.
    pub fn send(&self, message: &Bytes) {
        debug_assert!(!message.is_empty());
        let inner = self.inner.lock();
        for (_, sink) in &inner.sinks {
            sink(message);
        }
    }

    /// Advance the not-yet-sent position. Called by the log producer: once
    /// at initialization with the current log tail, then as records are
    /// handed to [`PriorSender::send`].
    pub fn set_unsent_lsa(&self, lsa: Lsa) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.unsent_lsa <= lsa);
        inner.unsent_lsa = lsa;
    }

    /// The position returned to the next [`PriorSender::add_sink`] caller.
    pub fn unsent_lsa(&self) -> Lsa {
        self.inner.lock().unsent_lsa
    }

    #[cfg(test)]
    fn sink_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }
}

impl Default for PriorSender {
    fn default() -> Self {
        Self::new()
    }
}

/// The slice of log-subsystem state the page-server coordinator needs: the
/// prior-list fan-out and the commit flush gate. Owned by the transaction
/// server and shared with every connection handler.
pub struct LogContext {
    prior_sender: PriorSender,
    flush_gate: QuorumFlushGate,
}

impl LogContext {
    pub fn new() -> Self {
        LogContext {
            prior_sender: PriorSender::new(),
            flush_gate: QuorumFlushGate::new(),
        }
    }

    pub fn prior_sender(&self) -> &PriorSender {
        &self.prior_sender
    }

    pub fn flush_gate(&self) -> &QuorumFlushGate {
        &self.flush_gate
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_add_sink_returns_unsent_position() {
        let sender = PriorSender::new();
        let (_, lsa) = sender.add_sink(Box::new(|_| {}));
        assert!(lsa.is_null());

        sender.set_unsent_lsa(Lsa::new(3, 120));
        let (_, lsa) = sender.add_sink(Box::new(|_| {}));
        assert_eq!(lsa, Lsa::new(3, 120));
    }

    #[test]
    fn test_emissions_reach_every_sink_in_order() {
        let sender = PriorSender::new();
        let seen_a: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_b: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&seen_a);
        sender.add_sink(Box::new(move |m| a.lock().unwrap().push(m.clone())));
        let b = Arc::clone(&seen_b);
        sender.add_sink(Box::new(move |m| b.lock().unwrap().push(m.clone())));

        sender.send(&Bytes::from_static(b"one"));
        sender.send(&Bytes::from_static(b"two"));

        for seen in [seen_a, seen_b] {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(&seen[0][..], b"one");
            assert_eq!(&seen[1][..], b"two");
        }
    }

    #[test]
    fn test_remove_sink_is_idempotent() {
        let sender = PriorSender::new();
        let (id, _) = sender.add_sink(Box::new(|_| {}));
        assert_eq!(sender.sink_count(), 1);
        sender.remove_sink(id);
        assert_eq!(sender.sink_count(), 0);
        sender.remove_sink(id);
        assert_eq!(sender.sink_count(), 0);
    }

    #[test]
    fn test_removed_sink_receives_nothing() {
        let sender = PriorSender::new();
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let (id, _) = sender.add_sink(Box::new(move |_| *counter.lock().unwrap() += 1));

        sender.send(&Bytes::from_static(b"x"));
        sender.remove_sink(id);
        sender.send(&Bytes::from_static(b"y"));

        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
