//! The failover unit entity
//!
//! One failover unit exists per partition on a node. It aggregates the replica set as this
//! node knows it, the in-flight reconfiguration, and the single-slot trackers of what is owed
//! to the FM. The protocol operations live in sibling modules as further `impl` blocks.

use crate::endpoint_publish::EndpointPublishState;
use crate::fm_message_state::FMMessageState;
use crate::messages::{CloseMode, ConfigurationBody, OpenMode, ReplicaBody};
use crate::reconfiguration::{ReconfigurationStage, ReconfigurationState};
use crate::replica::{Replica, ReplicaLsn, ReplicaMessageStage, ReplicaStore};
use crate::retryable_error::RetryableErrorState;
use ra_core::{
    DeactivationInfo, Epoch, FailoverUnitId, NodeId, NodeInstance, ReplicaDescription,
    ReplicaRole, ReplicaState, Timestamp,
};
use ra_entity::{Entity, LockedEntityPtr, RowType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Locked handle to a failover unit
pub type LockedFailoverUnitPtr = LockedEntityPtr<FailoverUnit>;

/// Whether the local replica is hosted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverUnitState {
    /// No hosted replica; the record may describe a down or dropped replica
    #[default]
    Closed,
    /// The local replica is hosted or being opened
    Open,
}

/// Who is told when a pending open completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenReplyTarget {
    /// Reply `AddPrimaryReply` to the FM
    AddPrimary,
    /// Reply `AddInstanceReply` to the FM
    AddInstance,
    /// Reply `CreateReplicaReply` to the primary's agent
    CreateReplica(NodeInstance),
}

/// Per-partition state on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnit {
    pub(crate) id: FailoverUnitId,
    pub(crate) owner: NodeId,
    pub(crate) state: FailoverUnitState,
    pub(crate) pc_epoch: Epoch,
    pub(crate) ic_epoch: Epoch,
    pub(crate) cc_epoch: Epoch,
    pub(crate) deactivation_info: DeactivationInfo,
    pub(crate) replicas: ReplicaStore,
    pub(crate) reconfiguration: ReconfigurationState,
    pub(crate) fm_message_state: FMMessageState,
    pub(crate) endpoint_publish: EndpointPublishState,
    pub(crate) retryable_error: RetryableErrorState,
    pub(crate) open_mode: Option<OpenMode>,
    pub(crate) open_reply_to: Option<OpenReplyTarget>,
    pub(crate) close_mode: Option<CloseMode>,
    pub(crate) sender_node: Option<NodeInstance>,
    pub(crate) is_persisted: bool,
    pub(crate) local_replica_deleted: bool,
    pub(crate) replicator_configuration_update_pending: bool,
    pub(crate) message_retry_active: bool,
    pub(crate) endpoint: String,
    pub(crate) last_updated: Timestamp,
    #[serde(skip)]
    pub(crate) last_message_resend: Option<Timestamp>,
}

impl Entity for FailoverUnit {
    type Id = FailoverUnitId;
    const ROW_TYPE: RowType = RowType::FailoverUnit;

    fn entity_id(&self) -> FailoverUnitId {
        self.id
    }
}

impl FailoverUnit {
    /// Closed failover unit with no replicas, as created on first reference
    pub fn new(id: FailoverUnitId, owner: NodeId, is_persisted: bool, now: Timestamp) -> Self {
        Self {
            id,
            owner,
            state: FailoverUnitState::Closed,
            pc_epoch: Epoch::invalid(),
            ic_epoch: Epoch::invalid(),
            cc_epoch: Epoch::invalid(),
            deactivation_info: DeactivationInfo::Invalid,
            replicas: ReplicaStore::new(),
            reconfiguration: ReconfigurationState::default(),
            fm_message_state: FMMessageState::default(),
            endpoint_publish: EndpointPublishState::default(),
            retryable_error: RetryableErrorState::default(),
            open_mode: None,
            open_reply_to: None,
            close_mode: None,
            sender_node: None,
            is_persisted,
            local_replica_deleted: false,
            replicator_configuration_update_pending: false,
            message_retry_active: false,
            endpoint: String::new(),
            last_updated: now,
            last_message_resend: None,
        }
    }

    /// Open unit hosting the local replica of an established configuration
    ///
    /// This is the shape a unit has after a completed reconfiguration. `replicas` should
    /// include the owner's replica.
    pub fn from_configuration(
        id: FailoverUnitId,
        owner: NodeId,
        is_persisted: bool,
        cc_epoch: Epoch,
        replicas: &[ReplicaDescription],
        now: Timestamp,
    ) -> Self {
        let mut ft = Self::new(id, owner, is_persisted, now);
        ft.state = FailoverUnitState::Open;
        ft.cc_epoch = cc_epoch;
        for desc in replicas {
            ft.replicas.add(Replica::from_description(desc));
        }
        ft
    }

    // ========================================================================
    // Read access
    // ========================================================================

    /// Partition id
    pub fn id(&self) -> FailoverUnitId {
        self.id
    }

    /// Node owning this record
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Open/closed
    pub fn state(&self) -> FailoverUnitState {
        self.state
    }

    /// Whether the local replica is hosted or being opened
    pub fn is_open(&self) -> bool {
        self.state == FailoverUnitState::Open
    }

    /// Whether the failover unit is closed
    pub fn is_closed(&self) -> bool {
        self.state == FailoverUnitState::Closed
    }

    /// Whether the local replica is open and no open is outstanding
    pub fn is_local_replica_open(&self) -> bool {
        self.is_open() && self.open_mode.is_none()
    }

    /// Whether a close of the local replica is outstanding
    pub fn is_close_pending(&self) -> bool {
        self.close_mode.is_some()
    }

    /// Outstanding close
    pub fn close_mode(&self) -> Option<CloseMode> {
        self.close_mode
    }

    /// Outstanding open
    pub fn open_mode(&self) -> Option<OpenMode> {
        self.open_mode
    }

    /// Previous configuration epoch
    pub fn pc_epoch(&self) -> Epoch {
        self.pc_epoch
    }

    /// Intermediate configuration epoch
    pub fn ic_epoch(&self) -> Epoch {
        self.ic_epoch
    }

    /// Current configuration epoch
    pub fn cc_epoch(&self) -> Epoch {
        self.cc_epoch
    }

    /// Deactivation info of the local replica
    pub fn deactivation_info(&self) -> DeactivationInfo {
        self.deactivation_info
    }

    /// Replica set
    pub fn replicas(&self) -> &ReplicaStore {
        &self.replicas
    }

    /// Reconfiguration state
    pub fn reconfiguration(&self) -> &ReconfigurationState {
        &self.reconfiguration
    }

    /// Current reconfiguration stage
    pub fn reconfiguration_stage(&self) -> ReconfigurationStage {
        self.reconfiguration.stage()
    }

    /// Whether a reconfiguration is running
    pub fn is_reconfiguring(&self) -> bool {
        self.reconfiguration.is_reconfiguring()
    }

    /// FM report state
    pub fn fm_message_state(&self) -> &FMMessageState {
        &self.fm_message_state
    }

    /// Endpoint publish state
    pub fn endpoint_publish(&self) -> &EndpointPublishState {
        &self.endpoint_publish
    }

    /// Failure counter
    pub fn retryable_error(&self) -> &RetryableErrorState {
        &self.retryable_error
    }

    /// Node whose request this unit is answering
    pub fn sender_node(&self) -> Option<NodeInstance> {
        self.sender_node
    }

    /// Whether the service keeps persisted state
    pub fn is_persisted(&self) -> bool {
        self.is_persisted
    }

    /// Whether the FM deleted the local replica
    pub fn is_local_replica_deleted(&self) -> bool {
        self.local_replica_deleted
    }

    /// Whether reconfiguration messages are being retried
    pub fn is_message_retry_active(&self) -> bool {
        self.message_retry_active
    }

    /// Whether the replicator must be told about a configuration change
    pub fn is_replicator_configuration_update_pending(&self) -> bool {
        self.replicator_configuration_update_pending
    }

    /// Endpoint of the local replica
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Time of the last durable change
    pub fn last_updated(&self) -> Timestamp {
        self.last_updated
    }

    /// Local replica
    pub fn local_replica(&self) -> Option<&Replica> {
        self.replicas.get(self.owner)
    }

    pub(crate) fn local_replica_mut(&mut self) -> Option<&mut Replica> {
        self.replicas.get_mut(self.owner)
    }

    /// Whether the local replica exists and is up
    pub fn is_local_replica_up(&self) -> bool {
        self.local_replica().is_some_and(|r| r.is_up)
    }

    /// Whether the local replica is dropped
    pub fn is_local_replica_dropped(&self) -> bool {
        self.local_replica().is_some_and(Replica::is_dropped)
    }

    /// Whether the local replica is the current configuration primary
    pub fn is_local_primary(&self) -> bool {
        self.local_replica()
            .is_some_and(|r| r.cc_role == ReplicaRole::Primary)
    }

    /// Whether the local replica is a ready, up primary
    pub fn is_local_ready_primary(&self) -> bool {
        self.local_replica().is_some_and(|r| {
            r.cc_role == ReplicaRole::Primary && r.state == ReplicaState::Ready && r.is_up
        })
    }

    /// Instance of the local replica
    pub fn local_instance(&self) -> Option<i64> {
        self.local_replica().map(|r| r.instance_id)
    }

    /// Whether the primary differs between the previous and current configuration
    pub fn has_primary_changed(&self) -> bool {
        let pc = self.replicas.pc_primary().map(Replica::node_id);
        let cc = self.replicas.cc_primary().map(Replica::node_id);
        self.pc_epoch.is_valid() && pc != cc
    }

    /// Wire form of the local replica
    pub fn local_description(&self) -> Option<ReplicaDescription> {
        self.local_replica().map(Replica::description)
    }

    // ========================================================================
    // Background pass membership
    // ========================================================================

    /// Belongs in the FM message retry set
    pub fn needs_fm_message(&self) -> bool {
        self.fm_message_state.is_pending()
    }

    /// Belongs in the reconfiguration message retry set
    pub fn needs_message_resend(&self) -> bool {
        self.message_retry_active
            || self.endpoint_publish.is_pending()
            || self.open_mode.is_some()
            || self.close_mode.is_some()
            || self.is_build_pending()
    }

    /// Whether the tombstone retention of a deleted unit has elapsed
    pub fn is_tombstone_expired(&self, now: Timestamp, retention: Duration) -> bool {
        self.is_closed()
            && self.local_replica_deleted
            && now.saturating_since(self.last_updated) >= retention
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    pub(crate) fn touch(&mut self, now: Timestamp) {
        self.last_updated = now;
    }

    pub(crate) fn configuration_body(&self) -> ConfigurationBody {
        ConfigurationBody {
            ft_id: self.id,
            pc_epoch: self.pc_epoch,
            cc_epoch: self.cc_epoch,
            replicas: self.replicas.descriptions(),
        }
    }

    pub(crate) fn replica_body(&self, replica: &Replica) -> ReplicaBody {
        ReplicaBody {
            ft_id: self.id,
            cc_epoch: self.cc_epoch,
            replica: replica.description(),
            is_persisted: self.is_persisted,
        }
    }

    pub(crate) fn local_replica_body(&self) -> Option<ReplicaBody> {
        self.local_replica().map(|r| self.replica_body(r))
    }

    /// Preserve the current configuration as the previous one before adopting a new one
    ///
    /// Only applies when no previous configuration is recorded and the local replica is part
    /// of the current one.
    pub(crate) fn copy_cc_to_pc(&mut self) {
        if self.pc_epoch.is_valid() {
            return;
        }
        if !self
            .local_replica()
            .is_some_and(Replica::is_in_current_configuration)
        {
            return;
        }
        self.pc_epoch = self.cc_epoch;
        for replica in self.replicas.iter_mut() {
            replica.pc_role = replica.cc_role;
        }
    }

    /// Adopt the epochs and roles of `body`, adding replicas this node did not know about
    pub(crate) fn adopt_configuration(&mut self, body: &ConfigurationBody) {
        self.pc_epoch = body.pc_epoch;
        self.cc_epoch = body.cc_epoch;
        for desc in &body.replicas {
            let replica = self.replicas.get_or_add(desc);
            replica.pc_role = desc.pc_role;
            replica.cc_role = desc.cc_role;
        }
    }

    /// Undo the current configuration change
    pub(crate) fn revert_configuration(&mut self) {
        if self.pc_epoch.is_valid() {
            self.cc_epoch = self.pc_epoch;
            for replica in self.replicas.iter_mut() {
                replica.cc_role = replica.pc_role;
            }
        }
        self.reset_reconfiguration_states();
    }

    /// Clear everything a reconfiguration leaves on the replicas
    ///
    /// Outstanding idle builds keep their message stage.
    pub(crate) fn reset_reconfiguration_states(&mut self) {
        self.pc_epoch = Epoch::invalid();
        self.ic_epoch = Epoch::invalid();
        for replica in self.replicas.iter_mut() {
            let building = !replica.is_in_configuration();
            replica.pc_role = ReplicaRole::None;
            replica.ic_role = ReplicaRole::None;
            replica.lsn = ReplicaLsn::NotSet;
            if !building {
                replica.message_stage = ReplicaMessageStage::None;
            }
            replica.clear_flags();
            replica.replicator_remove_pending = false;
            replica.deactivation_info = DeactivationInfo::Invalid;
        }
    }
}

impl fmt::Display for FailoverUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}/{}/{}",
            self.id,
            match self.state {
                FailoverUnitState::Open => "O",
                FailoverUnitState::Closed => "C",
            },
            self.reconfiguration.stage(),
            self.pc_epoch,
            self.ic_epoch,
            self.cc_epoch
        )?;
        for replica in self.replicas.iter() {
            write!(f, " {replica}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_new_unit_is_closed_and_empty() {
        let ft = FailoverUnit::new(ft_id(), NodeId(1), true, Timestamp(5));
        assert!(ft.is_closed());
        assert!(ft.cc_epoch().is_invalid());
        assert!(ft.local_replica().is_none());
        assert!(!ft.needs_fm_message());
        assert!(!ft.needs_message_resend());
    }

    #[test]
    fn test_from_configuration_hosts_local_replica() {
        let replicas = [
            ReplicaDescription::new(node(1), 1, 1)
                .with_roles(ReplicaRole::None, ReplicaRole::Primary),
            ReplicaDescription::new(node(2), 2, 1)
                .with_roles(ReplicaRole::None, ReplicaRole::Secondary),
        ];
        let ft = FailoverUnit::from_configuration(
            ft_id(),
            NodeId(1),
            true,
            epoch(4, 1, 1),
            &replicas,
            Timestamp(5),
        );
        assert!(ft.is_open());
        assert!(ft.is_local_primary());
        assert_eq!(ft.cc_epoch(), epoch(4, 1, 1));
        assert_eq!(ft.replicas().len(), 2);
    }

    #[test]
    fn test_copy_cc_to_pc_requires_local_in_cc() {
        let mut ft = open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, true),
            ],
        );
        ft.copy_cc_to_pc();
        assert_eq!(ft.pc_epoch(), epoch(4, 1, 1));
        assert_eq!(
            ft.replicas().get(NodeId(2)).map(|r| r.pc_role),
            Some(ReplicaRole::Secondary)
        );

        let mut ft = open_ft(epoch(4, 1, 1), &[(1, ReplicaRole::Idle, true)]);
        ft.copy_cc_to_pc();
        assert!(ft.pc_epoch().is_invalid());
    }

    #[test]
    fn test_revert_configuration() {
        let mut ft = open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, true),
            ],
        );
        ft.copy_cc_to_pc();
        ft.cc_epoch = epoch(4, 2, 0);
        if let Some(r) = ft.replicas.get_mut(NodeId(2)) {
            r.cc_role = ReplicaRole::Primary;
        }
        ft.revert_configuration();
        assert_eq!(ft.cc_epoch(), epoch(4, 1, 1));
        assert!(ft.pc_epoch().is_invalid());
        assert_eq!(
            ft.replicas().get(NodeId(2)).map(|r| r.cc_role),
            Some(ReplicaRole::Secondary)
        );
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut ft = open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, false),
            ],
        );
        ft.reconfiguration.start(
            crate::reconfiguration::ReconfigurationType::Failover,
            false,
            None,
            Timestamp(1),
        );
        let bytes = bincode::serialize(&ft).unwrap();
        let back: FailoverUnit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.cc_epoch(), ft.cc_epoch());
        assert_eq!(back.replicas(), ft.replicas());
        assert_eq!(back.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
    }

    #[test]
    fn test_tombstone_expiry() {
        let mut ft = FailoverUnit::new(ft_id(), NodeId(1), true, Timestamp(0));
        let retention = Duration::from_secs(60);
        assert!(!ft.is_tombstone_expired(Timestamp(120_000), retention));
        ft.local_replica_deleted = true;
        assert!(!ft.is_tombstone_expired(Timestamp(59_000), retention));
        assert!(ft.is_tombstone_expired(Timestamp(60_000), retention));
    }
}
