//! Failure counting for operations the state machine retries

use serde::{Deserialize, Serialize};

/// Operation whose failures are being counted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryableErrorStateName {
    /// Nothing being retried
    #[default]
    None,
    /// Opening the local replica
    ReplicaOpen,
    /// Changing the local replica's role during catch-up
    ReplicaChangeRoleAtCatchup,
}

/// What the caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableErrorAction {
    /// Retry silently
    Retry,
    /// Retry and raise a warning
    RetryWithWarning,
    /// Stop retrying; restart or drop the replica
    ThresholdReached,
}

/// Failure counter of one failover unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryableErrorState {
    current: RetryableErrorStateName,
    failure_count: u32,
}

impl RetryableErrorState {
    /// Operation being counted
    pub fn current(&self) -> RetryableErrorStateName {
        self.current
    }

    /// Failures so far
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Start counting `name`; the counter resets when the operation changes
    pub fn enter(&mut self, name: RetryableErrorStateName) {
        if self.current != name {
            self.current = name;
            self.failure_count = 0;
        }
    }

    /// Count one failure
    pub fn on_failure(&mut self, warning_threshold: u32, max_threshold: u32) -> RetryableErrorAction {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.failure_count >= max_threshold {
            RetryableErrorAction::ThresholdReached
        } else if self.failure_count >= warning_threshold {
            RetryableErrorAction::RetryWithWarning
        } else {
            RetryableErrorAction::Retry
        }
    }

    /// The operation succeeded
    pub fn on_success(&mut self) {
        self.current = RetryableErrorStateName::None;
        self.failure_count = 0;
    }
}
