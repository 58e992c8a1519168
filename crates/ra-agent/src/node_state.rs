//! Node activation latch
//!
//! The FM and the FMM each activate and deactivate the node for the units they own, with
//! sequence-numbered requests; the agent keeps one latch per owner. A change is
//! accepted only if it is newer than the applied one; the single exception is bootstrap, where
//! the node-up acknowledgement may flip the intent at an equal sequence number. Every accepted
//! change runs one sweep over the failover units; a newer change cancels the sweep in flight.

use crate::task_registry::CancellationSource;
use parking_lot::Mutex;
use ra_core::CancellationToken;
use std::fmt;
use std::sync::Arc;

/// Activation intent and its FM sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeDeactivationInfo {
    /// Whether the node should host replicas
    pub is_activated: bool,
    /// Monotonic sequence number issued by the owning failover manager
    pub sequence_number: i64,
}

impl NodeDeactivationInfo {
    /// State of a node that has not heard from the FM yet
    pub const INITIAL: NodeDeactivationInfo = NodeDeactivationInfo {
        is_activated: true,
        sequence_number: 0,
    };

    /// Activation request with `sequence_number`
    pub const fn activated(sequence_number: i64) -> Self {
        Self {
            is_activated: true,
            sequence_number,
        }
    }

    /// Deactivation request with `sequence_number`
    pub const fn deactivated(sequence_number: i64) -> Self {
        Self {
            is_activated: false,
            sequence_number,
        }
    }
}

impl Default for NodeDeactivationInfo {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl fmt::Display for NodeDeactivationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let intent = if self.is_activated {
            "activated"
        } else {
            "deactivated"
        };
        write!(f, "{}:{}", intent, self.sequence_number)
    }
}

/// Handle on an accepted change, passed back to [`NodeDeactivationState::finish_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeTicket {
    /// Accepted state
    pub info: NodeDeactivationInfo,
    instance: u64,
}

struct InFlightSweep {
    instance: u64,
    is_activated: bool,
    cancel: CancellationSource,
}

struct Inner {
    current: NodeDeactivationInfo,
    node_up_ack_processed: bool,
    instance: u64,
    sweep: Option<InFlightSweep>,
}

/// Sequence-numbered activation latch of the local node for one failover manager
pub struct NodeDeactivationState {
    inner: Mutex<Inner>,
}

impl fmt::Debug for NodeDeactivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NodeDeactivationState")
            .field("current", &inner.current)
            .field("node_up_ack_processed", &inner.node_up_ack_processed)
            .field("instance", &inner.instance)
            .finish()
    }
}

impl NodeDeactivationState {
    /// Latch in the initial activated state
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: NodeDeactivationInfo::INITIAL,
                node_up_ack_processed: false,
                instance: 0,
                sweep: None,
            }),
        }
    }

    /// Applied state
    pub fn current(&self) -> NodeDeactivationInfo {
        self.inner.lock().current
    }

    /// Whether the node hosts replicas
    pub fn is_activated(&self) -> bool {
        self.inner.lock().current.is_activated
    }

    /// Whether the node-up acknowledgement has been applied
    pub fn is_node_up_ack_processed(&self) -> bool {
        self.inner.lock().node_up_ack_processed
    }

    /// Close the bootstrap window
    pub fn on_node_up_ack_processed(&self) {
        self.inner.lock().node_up_ack_processed = true;
    }

    /// Whether a sweep is still registered
    pub fn is_sweep_in_flight(&self) -> bool {
        self.inner
            .lock()
            .sweep
            .as_ref()
            .is_some_and(|sweep| !sweep.cancel.is_cancelled())
    }

    /// Apply `info` if it is newer than the current state
    pub fn try_start_change(&self, info: NodeDeactivationInfo) -> Option<ChangeTicket> {
        let mut inner = self.inner.lock();
        let current = inner.current;
        let accepted = info.sequence_number > current.sequence_number
            || (info.sequence_number == current.sequence_number
                && info.is_activated != current.is_activated
                && !inner.node_up_ack_processed);
        if !accepted {
            tracing::debug!(current = %current, incoming = %info, "node activation change rejected");
            return None;
        }

        inner.instance += 1;
        inner.current = info;
        tracing::info!(previous = %current, current = %info, "node activation state changed");
        Some(ChangeTicket {
            info,
            instance: inner.instance,
        })
    }

    /// Register the sweep for an accepted change
    ///
    /// Returns the token the sweep must observe, or `None` when a newer change superseded
    /// `ticket`. A sweep of the opposite intent still in flight is cancelled first.
    pub fn finish_change(&self, ticket: ChangeTicket) -> Option<Arc<dyn CancellationToken>> {
        let mut inner = self.inner.lock();
        if ticket.instance < inner.instance {
            tracing::debug!(ticket = ticket.instance, current = inner.instance, "superseded node activation change");
            return None;
        }
        if let Some(previous) = inner.sweep.take() {
            if previous.is_activated != ticket.info.is_activated {
                tracing::debug!(instance = previous.instance, "cancelling node activation sweep");
            }
            previous.cancel.cancel();
        }
        let cancel = CancellationSource::new();
        let token = cancel.token();
        inner.sweep = Some(InFlightSweep {
            instance: ticket.instance,
            is_activated: ticket.info.is_activated,
            cancel,
        });
        Some(token)
    }

    /// Forget the sweep of `ticket` once it has run to completion
    pub fn on_sweep_completed(&self, ticket: ChangeTicket) {
        let mut inner = self.inner.lock();
        if inner
            .sweep
            .as_ref()
            .is_some_and(|sweep| sweep.instance == ticket.instance)
        {
            inner.sweep = None;
        }
    }
}

impl Default for NodeDeactivationState {
    fn default() -> Self {
        Self::new()
    }
}
