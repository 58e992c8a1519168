//! Fixtures shared by the unit tests of this crate

use crate::context::FailoverUnitContext;
use crate::failover_unit::{FailoverUnit, FailoverUnitState};
use crate::messages::{ConfigurationBody, DoReconfigurationBody, ReplicaBody};
use crate::replica::Replica;
use ra_core::{
    Epoch, FailoverConfig, FailoverUnitId, NodeId, NodeInstance, ReplicaDescription, ReplicaRole,
    Timestamp,
};

pub(crate) const NOW: Timestamp = Timestamp(1_000);

pub(crate) fn ft_id() -> FailoverUnitId {
    FailoverUnitId::from_u128(0x5eed)
}

/// Node `n` at instance 1
pub(crate) fn node(n: u64) -> NodeInstance {
    NodeInstance::new(n, 1)
}

pub(crate) fn epoch(data_loss: i64, primary: i64, minor: i64) -> Epoch {
    Epoch::from_parts(data_loss, primary, minor)
}

pub(crate) fn context(config: &FailoverConfig) -> FailoverUnitContext<'_> {
    FailoverUnitContext::new(node(1), config, NOW)
}

/// Open unit owned by node 1 with ready replicas `(node, cc role, up)`
pub(crate) fn open_ft(cc_epoch: Epoch, replicas: &[(u64, ReplicaRole, bool)]) -> FailoverUnit {
    let mut ft = FailoverUnit::new(ft_id(), NodeId(1), true, Timestamp(0));
    ft.state = FailoverUnitState::Open;
    ft.cc_epoch = cc_epoch;
    for &(n, role, up) in replicas {
        let desc = ReplicaDescription::new(node(n), n as i64, 1)
            .with_roles(ReplicaRole::None, role)
            .with_up(up);
        ft.replicas.add(Replica::from_description(&desc));
    }
    ft
}

/// Configuration with replicas `(node, pc role, cc role, up)`
pub(crate) fn configuration(
    pc_epoch: Epoch,
    cc_epoch: Epoch,
    replicas: &[(u64, ReplicaRole, ReplicaRole, bool)],
) -> ConfigurationBody {
    ConfigurationBody {
        ft_id: ft_id(),
        pc_epoch,
        cc_epoch,
        replicas: replicas
            .iter()
            .map(|&(n, pc, cc, up)| {
                ReplicaDescription::new(node(n), n as i64, 1)
                    .with_roles(pc, cc)
                    .with_up(up)
            })
            .collect(),
    }
}

pub(crate) fn do_reconfiguration(
    pc_epoch: Epoch,
    cc_epoch: Epoch,
    replicas: &[(u64, ReplicaRole, ReplicaRole, bool)],
) -> DoReconfigurationBody {
    DoReconfigurationBody {
        config: configuration(pc_epoch, cc_epoch, replicas),
        phase0_duration_ms: None,
        is_persisted: true,
    }
}

/// Replica body for `desc` under `cc_epoch`
pub(crate) fn replica_body(cc_epoch: Epoch, desc: ReplicaDescription) -> ReplicaBody {
    ReplicaBody {
        ft_id: ft_id(),
        cc_epoch,
        replica: desc,
        is_persisted: true,
    }
}
