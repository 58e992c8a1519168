//! Single-slot tracker of the report the FM is owed about the local replica

use ra_core::{ReplicaDescription, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of report owed to the FM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FMMessageStage {
    /// Nothing owed
    #[default]
    None,
    /// Local replica came up
    ReplicaUp,
    /// Down replica found at node start that the FM may not know about
    ReplicaUpload,
    /// Local replica went down
    ReplicaDown,
    /// Local replica was dropped
    ReplicaDropped,
}

/// FM message state of one failover unit
///
/// Retry bookkeeping is in-memory only; after a restart every pending report is retried
/// immediately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FMMessageState {
    stage: FMMessageStage,
    #[serde(skip)]
    last_sent: Option<Timestamp>,
    #[serde(skip)]
    sequence_number: u64,
}

impl FMMessageState {
    /// Owed report
    pub fn stage(&self) -> FMMessageStage {
        self.stage
    }

    /// Whether a report is owed
    pub fn is_pending(&self) -> bool {
        self.stage != FMMessageStage::None
    }

    /// Sequence number of the last send
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    fn set_stage(&mut self, stage: FMMessageStage) {
        if self.stage != stage {
            self.stage = stage;
            self.last_sent = None;
        }
    }

    /// The local replica is up
    pub fn on_replica_up(&mut self) {
        self.set_stage(FMMessageStage::ReplicaUp);
    }

    /// The local replica is down
    ///
    /// A pending dropped report is not downgraded.
    pub fn on_replica_down(&mut self) {
        if self.stage != FMMessageStage::ReplicaDropped {
            self.set_stage(FMMessageStage::ReplicaDown);
        }
    }

    /// The local replica is dropped
    pub fn on_dropped(&mut self) {
        self.set_stage(FMMessageStage::ReplicaDropped);
    }

    /// A down replica was found at node start
    pub fn on_replica_upload(&mut self) {
        if self.stage == FMMessageStage::None {
            self.set_stage(FMMessageStage::ReplicaUpload);
        }
    }

    /// The FM told this node about the replica, so a pending up report is implied
    pub fn on_replica_up_acknowledged_implicitly(&mut self) {
        if self.stage == FMMessageStage::ReplicaUp {
            self.set_stage(FMMessageStage::None);
        }
    }

    /// Forget the owed report
    pub fn reset(&mut self) {
        self.set_stage(FMMessageStage::None);
    }

    /// Whether a report should go out now, honouring the per-replica pacing
    pub fn should_retry(&self, now: Timestamp, min_interval: Duration) -> bool {
        if !self.is_pending() {
            return false;
        }
        match self.last_sent {
            None => true,
            Some(sent) => now.saturating_since(sent) >= min_interval,
        }
    }

    /// Record a send
    pub fn on_sent(&mut self, now: Timestamp, sequence_number: u64) {
        self.last_sent = Some(now);
        self.sequence_number = sequence_number;
    }

    /// Apply the FM's echo of a report; returns whether it acknowledged the owed stage
    ///
    /// Echoes of an older report are stale: a dropped report is only acknowledged by a dropped
    /// description, a down report by a down one, and an up report by an up description of the
    /// current instance.
    pub fn on_acknowledged(&mut self, desc: &ReplicaDescription, local_instance: i64) -> bool {
        let matches = match self.stage {
            FMMessageStage::None => false,
            FMMessageStage::ReplicaDropped => desc.is_dropped(),
            FMMessageStage::ReplicaDown => !desc.is_up && desc.instance_id == local_instance,
            FMMessageStage::ReplicaUp | FMMessageStage::ReplicaUpload => {
                desc.instance_id == local_instance && !desc.is_dropped()
            }
        };
        if matches {
            self.set_stage(FMMessageStage::None);
        }
        matches
    }
}
