//! Node and partition identities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Federation node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A node identifier together with the instance of the process running on it
///
/// The instance increases every time the node restarts, so two instances of the same node
/// are distinct message endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Node identifier
    pub id: NodeId,
    /// Process instance on the node
    pub instance: u64,
}

impl NodeInstance {
    /// Create a node instance
    pub fn new(id: u64, instance: u64) -> Self {
        Self {
            id: NodeId(id),
            instance,
        }
    }
}

impl fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.instance)
    }
}

/// Partition identifier; one failover unit exists per partition on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FailoverUnitId(pub Uuid);

impl FailoverUnitId {
    /// Partition of the failover manager service itself, owned by the FMM
    pub const FM_SERVICE: FailoverUnitId = FailoverUnitId(Uuid::from_u128(1));

    /// Generate a fresh random identifier
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic identifier, mostly useful in tests
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl fmt::Display for FailoverUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which failover manager owns a failover unit
///
/// The FMM manages the single partition of the FM service; the FM manages everything else.
/// Each owner drives node activation and receives replica reports independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverManagerId {
    /// Failover manager
    Fm,
    /// Failover manager master
    Fmm,
}

impl FailoverManagerId {
    /// Both owners, FM first
    pub const ALL: [FailoverManagerId; 2] = [FailoverManagerId::Fm, FailoverManagerId::Fmm];

    /// Owner of the failover unit `id`
    pub fn for_failover_unit(id: &FailoverUnitId) -> Self {
        if *id == FailoverUnitId::FM_SERVICE {
            FailoverManagerId::Fmm
        } else {
            FailoverManagerId::Fm
        }
    }

    /// Owner named by an `is_fmm` message flag
    pub fn from_is_fmm(is_fmm: bool) -> Self {
        if is_fmm {
            FailoverManagerId::Fmm
        } else {
            FailoverManagerId::Fm
        }
    }

    /// Whether this is the FMM
    pub fn is_fmm(self) -> bool {
        self == FailoverManagerId::Fmm
    }
}

impl fmt::Display for FailoverManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverManagerId::Fm => f.write_str("fm"),
            FailoverManagerId::Fmm => f.write_str("fmm"),
        }
    }
}
