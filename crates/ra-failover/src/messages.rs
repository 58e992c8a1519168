//! Message taxonomy exchanged with the FM, peer agents and the local replication proxy
//!
//! Wire encoding is owned by the transport; these are the decoded bodies. Every message
//! addressed to a failover unit carries the unit id and the sender's view of the current
//! configuration epoch.

use ra_core::{
    DeactivationInfo, Epoch, FailoverManagerId, FailoverUnitId, NodeInstance, ReplicaDescription,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a message comes from or goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// Failover manager
    Fm,
    /// Failover manager master, owner of the FM service partition
    Fmm,
    /// Local replication proxy
    Rap,
    /// Agent on another node
    Node(NodeInstance),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Fm => f.write_str("fm"),
            Endpoint::Fmm => f.write_str("fmm"),
            Endpoint::Rap => f.write_str("rap"),
            Endpoint::Node(node) => write!(f, "{node}"),
        }
    }
}

impl Endpoint {
    /// Endpoint of the failover manager `owner`
    pub fn failover_manager(owner: FailoverManagerId) -> Self {
        match owner {
            FailoverManagerId::Fm => Endpoint::Fm,
            FailoverManagerId::Fmm => Endpoint::Fmm,
        }
    }
}

/// Outbound message with its destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination
    pub target: Endpoint,
    /// Payload
    pub message: Message,
}

impl Envelope {
    /// Address `message` to `target`
    pub fn new(target: Endpoint, message: Message) -> Self {
        Self { target, message }
    }
}

/// Outcome carried by replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplyCode {
    /// Operation succeeded
    #[default]
    Success,
    /// Replica or partition not found on the replying side
    NotFound,
    /// Request epoch older than the replier's
    StaleRequest,
    /// Catch-up completed after the replica set changed on data loss
    StateChangedOnDataLoss,
    /// Demote completed before a cancel request arrived
    DemoteCompleted,
    /// Retryable failure
    Failed,
}

impl ReplyCode {
    /// Whether the code is [`ReplyCode::Success`]
    pub fn is_success(&self) -> bool {
        *self == ReplyCode::Success
    }
}

/// How the local replica is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    /// First open of a new replica
    Open,
    /// Reopen of a down replica from its persisted state
    Reopen,
    /// Role change of an open replica
    ChangeRole,
}

/// Why the local replica is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseMode {
    /// Node shutdown; persisted replicas stay reusable
    Close,
    /// Drop the replica and its state
    Drop,
    /// Close and reopen
    Restart,
    /// Abort without a graceful close; state is dropped
    Abort,
    /// Delete requested by the FM
    Delete,
    /// Forced deactivate from a new primary; the replica is rebuilt
    Deactivate,
    /// Node deactivation; reopened on node activation
    DeactivateNode,
}

impl CloseMode {
    /// Whether the close discards the replica's state
    pub fn implies_drop(&self) -> bool {
        matches!(
            self,
            CloseMode::Drop | CloseMode::Abort | CloseMode::Delete | CloseMode::Deactivate
        )
    }

    /// Whether the replica counts as down to the FM once its write status is revoked
    pub fn reports_down_on_revoke(&self) -> bool {
        !matches!(self, CloseMode::Delete)
    }
}

/// Fault reported by the hosted replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultType {
    /// Restart the replica
    Transient,
    /// Drop the replica
    Permanent,
}

/// Replicator operation requested by an `UpdateConfiguration`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateConfigurationKind {
    /// Catch up the secondaries before the primary demotes
    DemoteCatchup,
    /// Catch up the configuration after a primary change
    Catchup,
    /// Activate the new configuration and end the reconfiguration
    EndReconfiguration,
    /// Apply new roles on a secondary, or the replica membership on the primary
    UpdateRoles,
}

/// Configuration-wide body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationBody {
    /// Partition
    pub ft_id: FailoverUnitId,
    /// Previous configuration epoch
    pub pc_epoch: Epoch,
    /// Current configuration epoch
    pub cc_epoch: Epoch,
    /// Replica set
    pub replicas: Vec<ReplicaDescription>,
}

impl ConfigurationBody {
    /// Description of the replica on `node`
    pub fn replica_on(&self, node: ra_core::NodeId) -> Option<&ReplicaDescription> {
        self.replicas.iter().find(|r| r.node.id == node)
    }

    /// Description of the current configuration primary
    pub fn cc_primary(&self) -> Option<&ReplicaDescription> {
        self.replicas
            .iter()
            .find(|r| r.cc_role == ra_core::ReplicaRole::Primary)
    }
}

/// FM command to run a reconfiguration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoReconfigurationBody {
    /// Target configuration
    pub config: ConfigurationBody,
    /// Set when a demoted primary hands the swap over to the new primary
    pub phase0_duration_ms: Option<u64>,
    /// Whether the service keeps persisted state
    pub is_persisted: bool,
}

/// Deactivate request from a new primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateBody {
    /// Configuration being deactivated
    pub config: ConfigurationBody,
    /// Catch-up info the secondary should record
    pub deactivation_info: DeactivationInfo,
    /// Restart the secondary instead of deactivating it
    pub is_force: bool,
}

/// Body naming one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaBody {
    /// Partition
    pub ft_id: FailoverUnitId,
    /// Sender's current configuration epoch
    pub cc_epoch: Epoch,
    /// Replica concerned
    pub replica: ReplicaDescription,
    /// Whether the service keeps persisted state
    pub is_persisted: bool,
}

/// Reply naming one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReplyBody {
    /// Partition
    pub ft_id: FailoverUnitId,
    /// Replier's current configuration epoch
    pub cc_epoch: Epoch,
    /// Replica concerned, as seen by the replier
    pub replica: ReplicaDescription,
    /// Outcome
    pub code: ReplyCode,
}

/// Secondary's answer to `GetLSN`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLsnReplyBody {
    /// Replica progress
    pub reply: ReplicaReplyBody,
    /// Replica's recorded deactivation info
    pub deactivation_info: DeactivationInfo,
}

/// Local replicator command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfigurationBody {
    /// Requested operation
    pub kind: UpdateConfigurationKind,
    /// Configuration to apply
    pub config: ConfigurationBody,
}

/// Local replicator reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfigurationReplyBody {
    /// Operation replied to
    pub kind: UpdateConfigurationKind,
    /// Partition
    pub ft_id: FailoverUnitId,
    /// Epoch the operation ran under
    pub cc_epoch: Epoch,
    /// Replica progress as seen by the replicator
    pub replicas: Vec<ReplicaDescription>,
    /// Outcome
    pub code: ReplyCode,
}

/// Open request for the local replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaOpenBody {
    /// Replica to open
    pub replica: ReplicaBody,
    /// Open mode
    pub mode: OpenMode,
}

/// Close request for the local replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCloseBody {
    /// Replica to close
    pub replica: ReplicaBody,
    /// Close mode
    pub mode: CloseMode,
}

/// Fault report from the hosted replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFaultBody {
    /// Faulting replica
    pub replica: ReplicaBody,
    /// Fault kind
    pub fault: FaultType,
}

/// New endpoint of a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointBody {
    /// Replica whose endpoint changed
    pub replica: ReplicaBody,
    /// Service endpoint
    pub endpoint: String,
}

/// One partition entry in a `ReplicaUp` batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReport {
    /// Partition
    pub ft_id: FailoverUnitId,
    /// Current configuration epoch
    pub cc_epoch: Epoch,
    /// Local replica
    pub replica: ReplicaDescription,
}

/// Batched replica state report to the FM, echoed back as the acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaUpBody {
    /// Last batch of the upload
    pub is_last: bool,
    /// Reports failover units owned by the FMM
    pub is_from_fmm: bool,
    /// Up and down replicas
    pub replicas: Vec<ReplicaReport>,
    /// Dropped replicas
    pub dropped_replicas: Vec<ReplicaReport>,
}

/// Node activation or deactivation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeActivationBody {
    /// Monotonic sequence number of the request
    pub sequence_number: i64,
    /// Issued by the FMM rather than the FM
    pub is_fmm: bool,
}

/// Acknowledgement of the node's up message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpAckBody {
    /// Whether the node is activated
    pub is_activated: bool,
    /// Activation sequence number
    pub sequence_number: i64,
    /// Issued by the FMM rather than the FM
    pub is_fmm: bool,
}

/// Every message the agent consumes or produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Message {
    // From the FM
    DoReconfiguration(DoReconfigurationBody),
    AddPrimary(ReplicaBody),
    AddReplica(ReplicaBody),
    AddInstance(ReplicaBody),
    RemoveReplica(ReplicaBody),
    DeleteReplica(ReplicaBody),
    ReplicaUpReply(ReplicaUpBody),
    ReplicaEndpointUpdatedReply(ReplicaReplyBody),
    NodeActivateRequest(NodeActivationBody),
    NodeDeactivateRequest(NodeActivationBody),
    NodeUpAck(NodeUpAckBody),

    // To the FM
    ReplicaUp(ReplicaUpBody),
    ReplicaEndpointUpdated(EndpointBody),
    ChangeConfiguration(ConfigurationBody),
    DoReconfigurationReply(ConfigurationBody),
    DataLossReport(ConfigurationBody),
    AddPrimaryReply(ReplicaReplyBody),
    AddReplicaReply(ReplicaReplyBody),
    AddInstanceReply(ReplicaReplyBody),
    RemoveReplicaReply(ReplicaReplyBody),
    DeleteReplicaReply(ReplicaReplyBody),
    NodeActivateReply(NodeActivationBody),
    NodeDeactivateReply(NodeActivationBody),

    // Between agents
    GetLsn(ConfigurationBody),
    GetLsnReply(GetLsnReplyBody),
    Deactivate(DeactivateBody),
    DeactivateReply(ReplicaReplyBody),
    Activate(ConfigurationBody),
    ActivateReply(ReplicaReplyBody),
    CreateReplica(ReplicaBody),
    CreateReplicaReply(ReplicaReplyBody),

    // To the local replication proxy
    ReplicaOpen(ReplicaOpenBody),
    ReplicaClose(ReplicaCloseBody),
    UpdateConfiguration(UpdateConfigurationBody),
    ReplicatorGetStatus(ReplicaBody),
    ReplicatorUpdateEpochAndGetStatus(ConfigurationBody),
    CancelCatchupReplicaSet(ReplicaBody),
    ReplicatorBuildIdleReplica(ReplicaBody),
    ReplicatorRemoveIdleReplica(ReplicaBody),

    // From the local replication proxy
    UpdateConfigurationReply(UpdateConfigurationReplyBody),
    ReplicatorGetStatusReply(ReplicaReplyBody),
    ReplicatorUpdateEpochAndGetStatusReply(ReplicaReplyBody),
    CancelCatchupReplicaSetReply(ReplicaReplyBody),
    ReplicatorBuildIdleReplicaReply(ReplicaReplyBody),
    ReplicaOpenReply(ReplicaReplyBody),
    ReplicaCloseReply(ReplicaReplyBody),
    ReportFault(ReportFaultBody),
    ProxyReplicaEndpointUpdated(EndpointBody),
    ReadWriteStatusRevokedNotification(ReplicaBody),
}

/// Field-less discriminant of [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum MessageKind {
    DoReconfiguration,
    AddPrimary,
    AddReplica,
    AddInstance,
    RemoveReplica,
    DeleteReplica,
    ReplicaUpReply,
    ReplicaEndpointUpdatedReply,
    NodeActivateRequest,
    NodeDeactivateRequest,
    NodeUpAck,
    ReplicaUp,
    ReplicaEndpointUpdated,
    ChangeConfiguration,
    DoReconfigurationReply,
    DataLossReport,
    AddPrimaryReply,
    AddReplicaReply,
    AddInstanceReply,
    RemoveReplicaReply,
    DeleteReplicaReply,
    NodeActivateReply,
    NodeDeactivateReply,
    GetLsn,
    GetLsnReply,
    Deactivate,
    DeactivateReply,
    Activate,
    ActivateReply,
    CreateReplica,
    CreateReplicaReply,
    ReplicaOpen,
    ReplicaClose,
    UpdateConfiguration,
    ReplicatorGetStatus,
    ReplicatorUpdateEpochAndGetStatus,
    CancelCatchupReplicaSet,
    ReplicatorBuildIdleReplica,
    ReplicatorRemoveIdleReplica,
    UpdateConfigurationReply,
    ReplicatorGetStatusReply,
    ReplicatorUpdateEpochAndGetStatusReply,
    CancelCatchupReplicaSetReply,
    ReplicatorBuildIdleReplicaReply,
    ReplicaOpenReply,
    ReplicaCloseReply,
    ReportFault,
    ProxyReplicaEndpointUpdated,
    ReadWriteStatusRevokedNotification,
}

/// Dispatcher capabilities of one message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Admitted while the node is closing
    pub process_during_node_close: bool,
    /// Creates an empty failover unit entry when none exists
    pub create_failover_unit_if_missing: bool,
}

impl MessageMetadata {
    const fn new(process_during_node_close: bool, create_failover_unit_if_missing: bool) -> Self {
        Self {
            process_during_node_close,
            create_failover_unit_if_missing,
        }
    }
}

impl MessageKind {
    /// Metadata table entry
    pub fn metadata(&self) -> MessageMetadata {
        use MessageKind::*;
        match self {
            DoReconfiguration | AddPrimary | AddInstance | CreateReplica => {
                MessageMetadata::new(false, true)
            }
            ReplicaOpenReply
            | ReplicaCloseReply
            | ReportFault
            | ReadWriteStatusRevokedNotification
            | ReplicaUpReply
            | NodeUpAck
            | DeleteReplica => MessageMetadata::new(true, false),
            _ => MessageMetadata::new(false, false),
        }
    }
}

impl Message {
    /// Discriminant
    pub fn kind(&self) -> MessageKind {
        use Message as M;
        use MessageKind as K;
        match self {
            M::DoReconfiguration(_) => K::DoReconfiguration,
            M::AddPrimary(_) => K::AddPrimary,
            M::AddReplica(_) => K::AddReplica,
            M::AddInstance(_) => K::AddInstance,
            M::RemoveReplica(_) => K::RemoveReplica,
            M::DeleteReplica(_) => K::DeleteReplica,
            M::ReplicaUpReply(_) => K::ReplicaUpReply,
            M::ReplicaEndpointUpdatedReply(_) => K::ReplicaEndpointUpdatedReply,
            M::NodeActivateRequest(_) => K::NodeActivateRequest,
            M::NodeDeactivateRequest(_) => K::NodeDeactivateRequest,
            M::NodeUpAck(_) => K::NodeUpAck,
            M::ReplicaUp(_) => K::ReplicaUp,
            M::ReplicaEndpointUpdated(_) => K::ReplicaEndpointUpdated,
            M::ChangeConfiguration(_) => K::ChangeConfiguration,
            M::DoReconfigurationReply(_) => K::DoReconfigurationReply,
            M::DataLossReport(_) => K::DataLossReport,
            M::AddPrimaryReply(_) => K::AddPrimaryReply,
            M::AddReplicaReply(_) => K::AddReplicaReply,
            M::AddInstanceReply(_) => K::AddInstanceReply,
            M::RemoveReplicaReply(_) => K::RemoveReplicaReply,
            M::DeleteReplicaReply(_) => K::DeleteReplicaReply,
            M::NodeActivateReply(_) => K::NodeActivateReply,
            M::NodeDeactivateReply(_) => K::NodeDeactivateReply,
            M::GetLsn(_) => K::GetLsn,
            M::GetLsnReply(_) => K::GetLsnReply,
            M::Deactivate(_) => K::Deactivate,
            M::DeactivateReply(_) => K::DeactivateReply,
            M::Activate(_) => K::Activate,
            M::ActivateReply(_) => K::ActivateReply,
            M::CreateReplica(_) => K::CreateReplica,
            M::CreateReplicaReply(_) => K::CreateReplicaReply,
            M::ReplicaOpen(_) => K::ReplicaOpen,
            M::ReplicaClose(_) => K::ReplicaClose,
            M::UpdateConfiguration(_) => K::UpdateConfiguration,
            M::ReplicatorGetStatus(_) => K::ReplicatorGetStatus,
            M::ReplicatorUpdateEpochAndGetStatus(_) => K::ReplicatorUpdateEpochAndGetStatus,
            M::CancelCatchupReplicaSet(_) => K::CancelCatchupReplicaSet,
            M::ReplicatorBuildIdleReplica(_) => K::ReplicatorBuildIdleReplica,
            M::ReplicatorRemoveIdleReplica(_) => K::ReplicatorRemoveIdleReplica,
            M::UpdateConfigurationReply(_) => K::UpdateConfigurationReply,
            M::ReplicatorGetStatusReply(_) => K::ReplicatorGetStatusReply,
            M::ReplicatorUpdateEpochAndGetStatusReply(_) => {
                K::ReplicatorUpdateEpochAndGetStatusReply
            }
            M::CancelCatchupReplicaSetReply(_) => K::CancelCatchupReplicaSetReply,
            M::ReplicatorBuildIdleReplicaReply(_) => K::ReplicatorBuildIdleReplicaReply,
            M::ReplicaOpenReply(_) => K::ReplicaOpenReply,
            M::ReplicaCloseReply(_) => K::ReplicaCloseReply,
            M::ReportFault(_) => K::ReportFault,
            M::ProxyReplicaEndpointUpdated(_) => K::ProxyReplicaEndpointUpdated,
            M::ReadWriteStatusRevokedNotification(_) => K::ReadWriteStatusRevokedNotification,
        }
    }

    /// Metadata of this message's kind
    pub fn metadata(&self) -> MessageMetadata {
        self.kind().metadata()
    }

    /// Partition the message targets, if it targets exactly one
    pub fn ft_id(&self) -> Option<FailoverUnitId> {
        use Message as M;
        match self {
            M::DoReconfiguration(b) => Some(b.config.ft_id),
            M::ChangeConfiguration(b)
            | M::DoReconfigurationReply(b)
            | M::DataLossReport(b)
            | M::GetLsn(b)
            | M::Activate(b)
            | M::ReplicatorUpdateEpochAndGetStatus(b) => Some(b.ft_id),
            M::Deactivate(b) => Some(b.config.ft_id),
            M::UpdateConfiguration(b) => Some(b.config.ft_id),
            M::AddPrimary(b)
            | M::AddReplica(b)
            | M::AddInstance(b)
            | M::RemoveReplica(b)
            | M::DeleteReplica(b)
            | M::CreateReplica(b)
            | M::ReplicatorGetStatus(b)
            | M::CancelCatchupReplicaSet(b)
            | M::ReplicatorBuildIdleReplica(b)
            | M::ReplicatorRemoveIdleReplica(b)
            | M::ReadWriteStatusRevokedNotification(b) => Some(b.ft_id),
            M::ReplicaEndpointUpdatedReply(b)
            | M::AddPrimaryReply(b)
            | M::AddReplicaReply(b)
            | M::AddInstanceReply(b)
            | M::RemoveReplicaReply(b)
            | M::DeleteReplicaReply(b)
            | M::DeactivateReply(b)
            | M::ActivateReply(b)
            | M::CreateReplicaReply(b)
            | M::ReplicatorGetStatusReply(b)
            | M::ReplicatorUpdateEpochAndGetStatusReply(b)
            | M::CancelCatchupReplicaSetReply(b)
            | M::ReplicatorBuildIdleReplicaReply(b)
            | M::ReplicaOpenReply(b)
            | M::ReplicaCloseReply(b) => Some(b.ft_id),
            M::GetLsnReply(b) => Some(b.reply.ft_id),
            M::UpdateConfigurationReply(b) => Some(b.ft_id),
            M::ReplicaOpen(b) => Some(b.replica.ft_id),
            M::ReplicaClose(b) => Some(b.replica.ft_id),
            M::ReportFault(b) => Some(b.replica.ft_id),
            M::ReplicaEndpointUpdated(b) | M::ProxyReplicaEndpointUpdated(b) => {
                Some(b.replica.ft_id)
            }
            M::ReplicaUpReply(_)
            | M::ReplicaUp(_)
            | M::NodeActivateRequest(_)
            | M::NodeDeactivateRequest(_)
            | M::NodeUpAck(_)
            | M::NodeActivateReply(_)
            | M::NodeDeactivateReply(_) => None,
        }
    }
}
