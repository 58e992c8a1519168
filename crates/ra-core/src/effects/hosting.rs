//! Control over the locally hosted replicas

use crate::identity::FailoverUnitId;

/// Hosting layer of the local replicas
///
/// Graceful open and close travel as messages to the replication proxy. Termination is the
/// out-of-band path used when a node shutdown runs out of time.
pub trait ReplicaHosting: Send + Sync {
    /// Kill the hosted replica of `ft_id` without waiting for a close reply
    fn terminate_replica(&self, ft_id: FailoverUnitId);
}
