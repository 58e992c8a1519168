//! Deferred publication of a new primary's endpoint to the FM

use ra_core::{Epoch, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of an FM acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPublishAck {
    /// Nothing was pending
    Ignored,
    /// The pending publish is done
    Accepted,
    /// Wrong epoch or failure; publication stays pending and is resent
    Rearmed,
}

/// Endpoint publish state of one failover unit
///
/// Publication is deferred for a configured delay after the endpoint becomes known. If the
/// reconfiguration completes first, its reply carries the endpoint and the publish is
/// cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPublishState {
    pending_since: Option<Timestamp>,
    primary_epoch: Epoch,
    #[serde(skip)]
    last_sent: Option<Timestamp>,
}

impl EndpointPublishState {
    /// Whether a publish is owed
    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Primary epoch the pending publish belongs to
    pub fn primary_epoch(&self) -> Epoch {
        self.primary_epoch
    }

    /// Start a publish for `cc_epoch`; a publish already pending for the same primary is kept
    pub fn start(&mut self, cc_epoch: Epoch, now: Timestamp) {
        let primary_epoch = cc_epoch.to_primary_epoch();
        if self.is_pending() && self.primary_epoch == primary_epoch {
            return;
        }
        self.pending_since = Some(now);
        self.primary_epoch = primary_epoch;
        self.last_sent = None;
    }

    /// Drop any pending publish
    pub fn clear(&mut self) {
        self.pending_since = None;
        self.last_sent = None;
    }

    /// Called from the reconfiguration retry pass; returns whether to send now
    pub fn on_reconfiguration_timer(
        &mut self,
        now: Timestamp,
        delay: Duration,
        retry_interval: Duration,
    ) -> bool {
        let Some(since) = self.pending_since else {
            return false;
        };
        if now.saturating_since(since) < delay {
            return false;
        }
        if let Some(sent) = self.last_sent {
            if now.saturating_since(sent) < retry_interval {
                return false;
            }
        }
        self.last_sent = Some(now);
        true
    }

    /// Apply the FM's reply to a publish
    pub fn on_fm_reply(&mut self, epoch: Epoch, success: bool) -> EndpointPublishAck {
        if !self.is_pending() {
            return EndpointPublishAck::Ignored;
        }
        if success && epoch.to_primary_epoch() == self.primary_epoch {
            self.clear();
            EndpointPublishAck::Accepted
        } else {
            self.last_sent = None;
            EndpointPublishAck::Rearmed
        }
    }
}
