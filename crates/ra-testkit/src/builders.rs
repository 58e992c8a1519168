//! Failover unit fixtures

use ra_core::{
    Epoch, FailoverUnitId, NodeId, NodeInstance, ReplicaDescription, ReplicaRole, Timestamp,
};
use ra_entity::{LfumStore, RowType, StoreOperationType};
use ra_failover::FailoverUnit;

/// Builder for an open failover unit as the agent would have persisted it
///
/// Replicas are added with [`replica`](Self::replica); the unit is owned by the node of
/// the first replica unless [`owner`](Self::owner) says otherwise.
#[derive(Debug, Clone)]
pub struct FailoverUnitBuilder {
    id: FailoverUnitId,
    owner: Option<NodeId>,
    is_persisted: bool,
    cc_epoch: Epoch,
    replicas: Vec<ReplicaDescription>,
    now: Timestamp,
}

impl FailoverUnitBuilder {
    /// Start a persisted unit at epoch `(1, 1, 0)`
    pub fn new(id: FailoverUnitId) -> Self {
        Self {
            id,
            owner: None,
            is_persisted: true,
            cc_epoch: Epoch::from_parts(1, 1, 0),
            replicas: Vec::new(),
            now: Timestamp::ZERO,
        }
    }

    /// Node hosting the local replica
    pub fn owner(mut self, owner: NodeId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Whether the service keeps state on disk
    pub fn persisted(mut self, is_persisted: bool) -> Self {
        self.is_persisted = is_persisted;
        self
    }

    /// Current configuration epoch
    pub fn epoch(mut self, cc_epoch: Epoch) -> Self {
        self.cc_epoch = cc_epoch;
        self
    }

    /// Time of the last change
    pub fn at(mut self, now: Timestamp) -> Self {
        self.now = now;
        self
    }

    /// Add an up, ready configuration member on `node` with `role`
    pub fn replica(mut self, node: NodeInstance, role: ReplicaRole) -> Self {
        let replica_id = i64::try_from(node.id.0).unwrap_or(i64::MAX);
        self.replicas.push(
            ReplicaDescription::new(node, replica_id, 1)
                .with_roles(ReplicaRole::None, role)
                .with_up(true),
        );
        self
    }

    /// Add a replica exactly as described
    pub fn description(mut self, desc: ReplicaDescription) -> Self {
        self.replicas.push(desc);
        self
    }

    /// Build the unit
    pub fn build(self) -> FailoverUnit {
        let owner = self
            .owner
            .or_else(|| self.replicas.first().map(|r| r.node.id))
            .unwrap_or(NodeId(0));
        FailoverUnit::from_configuration(
            self.id,
            owner,
            self.is_persisted,
            self.cc_epoch,
            &self.replicas,
            self.now,
        )
    }
}

/// Insert `units` into `store` the way a commit would
pub async fn seed_store(store: &dyn LfumStore, units: &[FailoverUnit]) -> anyhow::Result<()> {
    for ft in units {
        let data = bincode::serialize(ft)?;
        store
            .write(
                StoreOperationType::Insert,
                RowType::FailoverUnit,
                &ft.id().to_string(),
                Some(data),
            )
            .await?;
    }
    Ok(())
}
