//! Per-replica bookkeeping inside a failover unit

use ra_core::{
    DeactivationInfo, NodeId, NodeInstance, ReplicaDescription, ReplicaRole, ReplicaState,
    INVALID_LSN,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Progress a replica reported during a reconfiguration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaLsn {
    /// Nothing reported yet
    #[default]
    NotSet,
    /// The replica replied but could not tell its progress
    Unknown,
    /// Acknowledged range
    Known {
        /// First acknowledged LSN
        first: i64,
        /// Last acknowledged LSN
        last: i64,
    },
}

impl ReplicaLsn {
    /// Whether a reply was recorded, known or not
    pub fn is_set(&self) -> bool {
        !matches!(self, ReplicaLsn::NotSet)
    }

    /// Whether the reply carried a known range
    pub fn is_known(&self) -> bool {
        matches!(self, ReplicaLsn::Known { .. })
    }

    /// First LSN or [`INVALID_LSN`]
    pub fn first(&self) -> i64 {
        match self {
            ReplicaLsn::Known { first, .. } => *first,
            _ => INVALID_LSN,
        }
    }

    /// Last LSN or [`INVALID_LSN`]
    pub fn last(&self) -> i64 {
        match self {
            ReplicaLsn::Known { last, .. } => *last,
            _ => INVALID_LSN,
        }
    }

    /// Map a wire description's range
    pub fn from_description(desc: &ReplicaDescription) -> Self {
        if desc.last_lsn == INVALID_LSN {
            ReplicaLsn::Unknown
        } else {
            ReplicaLsn::Known {
                first: desc.first_lsn,
                last: desc.last_lsn,
            }
        }
    }
}

/// Outstanding request to a replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMessageStage {
    /// Nothing outstanding
    #[default]
    None,
    /// Waiting on a peer agent
    RAReplyPending,
    /// Waiting on the local replication proxy
    RAProxyReplyPending,
}

/// One replica of the partition, local or remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Hosting node
    pub node: NodeInstance,
    /// Replica id
    pub replica_id: i64,
    /// Replica instance
    pub instance_id: i64,
    /// Role in the previous configuration
    pub pc_role: ReplicaRole,
    /// Role in the intermediate configuration
    pub ic_role: ReplicaRole,
    /// Role in the current configuration
    pub cc_role: ReplicaRole,
    /// Lifecycle state
    pub state: ReplicaState,
    /// Up/down
    pub is_up: bool,
    /// Must be activated in Phase4
    pub to_be_activated: bool,
    /// Must be deactivated before activation
    pub to_be_deactivated: bool,
    /// Must be restarted before the reconfiguration completes
    pub to_be_restarted: bool,
    /// Waiting for the replicator to forget the replica
    pub replicator_remove_pending: bool,
    /// Reported progress
    pub lsn: ReplicaLsn,
    /// Deactivation info the replica reported
    pub deactivation_info: DeactivationInfo,
    /// Outstanding request
    pub message_stage: ReplicaMessageStage,
}

impl Replica {
    /// Replica built from a wire description; LSNs are not carried over
    pub fn from_description(desc: &ReplicaDescription) -> Self {
        Self {
            node: desc.node,
            replica_id: desc.replica_id,
            instance_id: desc.instance_id,
            pc_role: desc.pc_role,
            ic_role: ReplicaRole::None,
            cc_role: desc.cc_role,
            state: desc.state,
            is_up: desc.is_up,
            to_be_activated: false,
            to_be_deactivated: false,
            to_be_restarted: false,
            replicator_remove_pending: false,
            lsn: ReplicaLsn::NotSet,
            deactivation_info: DeactivationInfo::Invalid,
            message_stage: ReplicaMessageStage::None,
        }
    }

    /// Node id
    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    /// In the previous or current configuration
    pub fn is_in_configuration(&self) -> bool {
        self.pc_role.is_in_configuration() || self.cc_role.is_in_configuration()
    }

    /// In the previous configuration
    pub fn is_in_previous_configuration(&self) -> bool {
        self.pc_role.is_in_configuration()
    }

    /// In the current configuration
    pub fn is_in_current_configuration(&self) -> bool {
        self.cc_role.is_in_configuration()
    }

    /// Dropped or being dropped
    pub fn is_dropped(&self) -> bool {
        self.state.is_dropped_or_in_drop()
    }

    /// Ready and up
    pub fn is_ready_and_up(&self) -> bool {
        self.is_up && self.state == ReplicaState::Ready
    }

    /// Mark down
    pub fn mark_down(&mut self) {
        self.is_up = false;
    }

    /// Mark dropped and down
    pub fn mark_dropped(&mut self) {
        self.state = ReplicaState::Dropped;
        self.is_up = false;
        self.clear_flags();
        self.message_stage = ReplicaMessageStage::None;
    }

    /// Clear every pending-action flag
    pub fn clear_flags(&mut self) {
        self.to_be_activated = false;
        self.to_be_deactivated = false;
        self.to_be_restarted = false;
    }

    /// Wire form of this replica
    pub fn description(&self) -> ReplicaDescription {
        ReplicaDescription {
            node: self.node,
            replica_id: self.replica_id,
            instance_id: self.instance_id,
            pc_role: self.pc_role,
            cc_role: self.cc_role,
            state: self.state,
            is_up: self.is_up,
            first_lsn: self.lsn.first(),
            last_lsn: self.lsn.last(),
        }
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}/{} {} {}",
            self.pc_role,
            self.ic_role,
            self.cc_role,
            self.state,
            if self.is_up { "U" } else { "D" }
        )?;
        if self.to_be_activated {
            f.write_str(" A")?;
        }
        if self.to_be_deactivated {
            f.write_str(" D")?;
        }
        if self.to_be_restarted {
            f.write_str(" R")?;
        }
        write!(f, " {}:{}]", self.node, self.instance_id)
    }
}

/// Ordered replicas of one partition, at most one per node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStore {
    replicas: Vec<Replica>,
}

impl ReplicaStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of replicas
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Replica on `node`
    pub fn get(&self, node: NodeId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.node.id == node)
    }

    /// Mutable replica on `node`
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.node.id == node)
    }

    /// Add a replica
    ///
    /// # Panics
    ///
    /// If a replica on the same node already exists.
    pub fn add(&mut self, replica: Replica) -> &mut Replica {
        assert!(
            self.get(replica.node.id).is_none(),
            "replica on {} already exists",
            replica.node.id
        );
        self.replicas.push(replica);
        let last = self.replicas.len() - 1;
        &mut self.replicas[last]
    }

    /// Existing replica on the description's node, or a new one built from it
    pub fn get_or_add(&mut self, desc: &ReplicaDescription) -> &mut Replica {
        match self.replicas.iter().position(|r| r.node.id == desc.node.id) {
            Some(index) => &mut self.replicas[index],
            None => self.add(Replica::from_description(desc)),
        }
    }

    /// Remove the replica on `node`
    pub fn remove(&mut self, node: NodeId) -> Option<Replica> {
        let index = self.replicas.iter().position(|r| r.node.id == node)?;
        Some(self.replicas.remove(index))
    }

    /// Keep only replicas matching `keep`
    pub fn retain<F: FnMut(&Replica) -> bool>(&mut self, keep: F) {
        self.replicas.retain(keep);
    }

    /// All replicas
    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter()
    }

    /// All replicas, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.replicas.iter_mut()
    }

    /// Replicas that are not on `local`
    pub fn remote(&self, local: NodeId) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(move |r| r.node.id != local)
    }

    /// Remote replicas, mutably
    pub fn remote_mut(&mut self, local: NodeId) -> impl Iterator<Item = &mut Replica> {
        self.replicas.iter_mut().filter(move |r| r.node.id != local)
    }

    /// Local replica and replicas with a previous or current configuration role
    pub fn configuration(&self, local: NodeId) -> impl Iterator<Item = &Replica> {
        self.replicas
            .iter()
            .filter(move |r| r.node.id == local || r.is_in_configuration())
    }

    /// Remote replicas with a configuration role
    pub fn configuration_remote(&self, local: NodeId) -> impl Iterator<Item = &Replica> {
        self.replicas
            .iter()
            .filter(move |r| r.node.id != local && r.is_in_configuration())
    }

    /// Remote replicas with a configuration role, mutably
    pub fn configuration_remote_mut(
        &mut self,
        local: NodeId,
    ) -> impl Iterator<Item = &mut Replica> {
        self.replicas
            .iter_mut()
            .filter(move |r| r.node.id != local && r.is_in_configuration())
    }

    /// Replicas outside both configurations
    pub fn idle(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| !r.is_in_configuration())
    }

    /// Current configuration primary
    pub fn cc_primary(&self) -> Option<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.cc_role == ReplicaRole::Primary)
    }

    /// Previous configuration primary
    pub fn pc_primary(&self) -> Option<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.pc_role == ReplicaRole::Primary)
    }

    /// Wire descriptions of every replica
    pub fn descriptions(&self) -> Vec<ReplicaDescription> {
        self.replicas.iter().map(Replica::description).collect()
    }
}
