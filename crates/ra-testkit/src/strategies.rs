//! Property test strategies for reconfiguration agent types

use proptest::prelude::*;
use ra_core::{Epoch, NodeInstance, ReplicaDescription, ReplicaRole};

pub use proptest;

/// Valid epochs with small counters, so generated pairs collide often
pub fn arb_epoch() -> impl Strategy<Value = Epoch> {
    (1i64..4, 1i64..4, 0i64..4)
        .prop_map(|(data_loss, primary, minor)| Epoch::from_parts(data_loss, primary, minor))
}

/// Node instances on nodes `1..=8`
pub fn arb_node_instance() -> impl Strategy<Value = NodeInstance> {
    (1u64..=8, 1u64..4).prop_map(|(id, instance)| NodeInstance::new(id, instance))
}

/// Any replica role
pub fn arb_replica_role() -> impl Strategy<Value = ReplicaRole> {
    prop_oneof![
        Just(ReplicaRole::None),
        Just(ReplicaRole::Idle),
        Just(ReplicaRole::Secondary),
        Just(ReplicaRole::Primary),
    ]
}

/// Replica descriptions with arbitrary roles and liveness
pub fn arb_replica_description() -> impl Strategy<Value = ReplicaDescription> {
    (
        arb_node_instance(),
        1i64..4,
        arb_replica_role(),
        arb_replica_role(),
        any::<bool>(),
    )
        .prop_map(|(node, instance_id, pc, cc, up)| {
            let replica_id = i64::try_from(node.id.0).unwrap_or(i64::MAX);
            ReplicaDescription::new(node, replica_id, instance_id)
                .with_roles(pc, cc)
                .with_up(up)
        })
}

/// Node activation sequence numbers as the FM issues them
pub fn arb_activation_sequence() -> impl Strategy<Value = Vec<(i64, bool)>> {
    prop::collection::vec((0i64..20, any::<bool>()), 1..16)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn prop_generated_epochs_are_valid(epoch in arb_epoch()) {
            prop_assert!(epoch.is_valid());
        }
    }
}
