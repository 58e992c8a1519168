//! Replica roles, lifecycle states and wire descriptions

use crate::epoch::Epoch;
use crate::identity::NodeInstance;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sequence number that has not been reported
pub const INVALID_LSN: i64 = -1;

/// Role of a replica in one configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Not part of the configuration
    #[default]
    None,
    /// Hosted but not in the configuration (being built)
    Idle,
    /// Configuration secondary
    Secondary,
    /// Configuration primary
    Primary,
}

impl ReplicaRole {
    /// Whether the role counts toward the configuration
    pub fn is_in_configuration(&self) -> bool {
        matches!(self, ReplicaRole::Secondary | ReplicaRole::Primary)
    }

    /// Single-letter form used in logs and test fixtures
    pub fn code(&self) -> &'static str {
        match self {
            ReplicaRole::None => "N",
            ReplicaRole::Idle => "I",
            ReplicaRole::Secondary => "S",
            ReplicaRole::Primary => "P",
        }
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Lifecycle state of a replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Being created on its node
    InCreate,
    /// Created, being built by the primary's replicator
    InBuild,
    /// Fully built
    Ready,
    /// Being dropped
    InDrop,
    /// Dropped; terminal for this instance
    #[default]
    Dropped,
    /// Down but its persisted state may be reused
    StandBy,
}

impl ReplicaState {
    /// Whether the replica is dropped or being dropped
    pub fn is_dropped_or_in_drop(&self) -> bool {
        matches!(self, ReplicaState::Dropped | ReplicaState::InDrop)
    }

    /// Two-letter form used in logs and test fixtures
    pub fn code(&self) -> &'static str {
        match self {
            ReplicaState::InCreate => "IC",
            ReplicaState::InBuild => "IB",
            ReplicaState::Ready => "RD",
            ReplicaState::InDrop => "ID",
            ReplicaState::Dropped => "DD",
            ReplicaState::StandBy => "SB",
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Catch-up progress a replica recorded for the primary it was last deactivated under
///
/// The epoch names the configuration in which the replica was deactivated and
/// `catchup_lsn` the LSN it had to reach to be considered caught up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeactivationInfo {
    /// No information recorded
    #[default]
    Invalid,
    /// The replica has been dropped and holds no usable state
    Dropped,
    /// Deactivated in `epoch` with catch-up target `catchup_lsn`
    Valid {
        /// Configuration epoch of the deactivation
        epoch: Epoch,
        /// LSN the replica had to acknowledge
        catchup_lsn: i64,
    },
}

impl DeactivationInfo {
    /// Create a valid deactivation info
    pub fn new(epoch: Epoch, catchup_lsn: i64) -> Self {
        DeactivationInfo::Valid { epoch, catchup_lsn }
    }

    /// Whether the info carries an epoch
    pub fn is_valid(&self) -> bool {
        matches!(self, DeactivationInfo::Valid { .. })
    }

    /// Whether the info marks a dropped replica
    pub fn is_dropped(&self) -> bool {
        matches!(self, DeactivationInfo::Dropped)
    }

    /// Deactivation epoch, invalid if none recorded
    pub fn epoch(&self) -> Epoch {
        match self {
            DeactivationInfo::Valid { epoch, .. } => *epoch,
            _ => Epoch::invalid(),
        }
    }

    /// Catch-up LSN, [`INVALID_LSN`] if none recorded
    pub fn catchup_lsn(&self) -> i64 {
        match self {
            DeactivationInfo::Valid { catchup_lsn, .. } => *catchup_lsn,
            _ => INVALID_LSN,
        }
    }
}

impl fmt::Display for DeactivationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeactivationInfo::Invalid => f.write_str("-"),
            DeactivationInfo::Dropped => f.write_str("dropped"),
            DeactivationInfo::Valid { epoch, catchup_lsn } => write!(f, "{epoch}:{catchup_lsn}"),
        }
    }
}

/// Replica as described in protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    /// Hosting node
    pub node: NodeInstance,
    /// Replica identifier, stable across restarts of the replica
    pub replica_id: i64,
    /// Instance, bumped every time the replica is recreated
    pub instance_id: i64,
    /// Role in the previous configuration
    pub pc_role: ReplicaRole,
    /// Role in the current configuration
    pub cc_role: ReplicaRole,
    /// Lifecycle state
    pub state: ReplicaState,
    /// Whether the replica is up
    pub is_up: bool,
    /// First acknowledged LSN
    pub first_lsn: i64,
    /// Last acknowledged LSN
    pub last_lsn: i64,
}

impl ReplicaDescription {
    /// Ready, up replica with no configuration role and no LSN
    pub fn new(node: NodeInstance, replica_id: i64, instance_id: i64) -> Self {
        Self {
            node,
            replica_id,
            instance_id,
            pc_role: ReplicaRole::None,
            cc_role: ReplicaRole::None,
            state: ReplicaState::Ready,
            is_up: true,
            first_lsn: INVALID_LSN,
            last_lsn: INVALID_LSN,
        }
    }

    /// Set previous and current configuration roles
    pub fn with_roles(mut self, pc_role: ReplicaRole, cc_role: ReplicaRole) -> Self {
        self.pc_role = pc_role;
        self.cc_role = cc_role;
        self
    }

    /// Set the lifecycle state
    pub fn with_state(mut self, state: ReplicaState) -> Self {
        self.state = state;
        self
    }

    /// Set the up flag
    pub fn with_up(mut self, is_up: bool) -> Self {
        self.is_up = is_up;
        self
    }

    /// Set the acknowledged LSN range
    pub fn with_lsn(mut self, first_lsn: i64, last_lsn: i64) -> Self {
        self.first_lsn = first_lsn;
        self.last_lsn = last_lsn;
        self
    }

    /// Whether the description reports the replica dropped
    pub fn is_dropped(&self) -> bool {
        self.state == ReplicaState::Dropped
    }

    /// Whether the description reports a ready, up replica
    pub fn is_ready_and_up(&self) -> bool {
        self.is_up && self.state == ReplicaState::Ready
    }
}

impl fmt::Display for ReplicaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{} {} {} {}:{}]",
            self.pc_role,
            self.cc_role,
            self.state,
            if self.is_up { "U" } else { "D" },
            self.node,
            self.instance_id
        )
    }
}
