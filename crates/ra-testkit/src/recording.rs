//! Recording doubles for the agent's outbound effects

use parking_lot::Mutex;
use ra_core::{FailoverUnitId, ReplicaHosting};
use ra_entity::MessageSink;
use ra_failover::{Endpoint, Envelope, MessageKind};

/// Sink that keeps every envelope it is handed
#[derive(Debug, Default)]
pub struct RecordingMessageSink {
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingMessageSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded envelopes
    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Copy of the recorded envelopes
    pub fn messages(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Recorded envelopes of one kind addressed to `target`
    pub fn sent_to(&self, target: &Endpoint, kind: MessageKind) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .filter(|e| &e.target == target && e.message.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of recorded envelopes
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl MessageSink<Envelope> for RecordingMessageSink {
    fn send(&self, message: Envelope) {
        self.sent.lock().push(message);
    }
}

/// Hosting double that records forced terminations
#[derive(Debug, Default)]
pub struct RecordingHosting {
    terminated: Mutex<Vec<FailoverUnitId>>,
}

impl RecordingHosting {
    /// Create a hosting double with nothing terminated
    pub fn new() -> Self {
        Self::default()
    }

    /// Units terminated so far, in order
    pub fn terminated(&self) -> Vec<FailoverUnitId> {
        self.terminated.lock().clone()
    }
}

impl ReplicaHosting for RecordingHosting {
    fn terminate_replica(&self, ft_id: FailoverUnitId) {
        self.terminated.lock().push(ft_id);
    }
}
