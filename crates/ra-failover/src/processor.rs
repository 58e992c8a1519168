//! Routes one message to the failover unit it targets
//!
//! Admission is decided on the committed value. Only admitted messages take a working copy of
//! the unit, so rejected messages commit as no-ops. An admitted message commits in memory
//! unless the operation asked for a durable update.

use crate::context::FailoverUnitContext;
use crate::failover_unit::{FailoverUnit, LockedFailoverUnitPtr, OpenReplyTarget};
use crate::messages::{Endpoint, Message, ReplicaReplyBody, ReplyCode};
use crate::secondary::get_lsn_not_found_reply;
use ra_core::NodeInstance;

/// Apply `message` from `from` to the locked unit
///
/// Side effects are queued on `ctx`; the caller executes them once the commit succeeds.
pub fn process_message(
    locked: &mut LockedFailoverUnitPtr,
    from: &Endpoint,
    message: &Message,
    ctx: &mut FailoverUnitContext<'_>,
) {
    if !ctx.node_activated && opens_replica(message) {
        tracing::debug!(ft = %locked.id(), kind = ?message.kind(), "node deactivated; open rejected");
        return;
    }
    if !locked.is_present() && !process_for_absent_unit(locked, from, message, ctx) {
        return;
    }
    let Some(ft) = locked.get() else {
        return;
    };
    if !is_admitted(ft, from, message) {
        return;
    }

    let ft = locked.enable_in_memory_update();
    dispatch(ft, from, message, ctx);
    if ctx.is_update_requested() {
        locked.enable_update();
    }
}

/// Handle a message for a partition this node has no record of
///
/// Returns whether an empty unit was created for the message to be applied to.
fn process_for_absent_unit(
    locked: &mut LockedFailoverUnitPtr,
    from: &Endpoint,
    message: &Message,
    ctx: &mut FailoverUnitContext<'_>,
) -> bool {
    let id = *locked.id();
    match message {
        Message::GetLsn(body) => {
            if let (Endpoint::Node(sender), Some(reply)) =
                (from, get_lsn_not_found_reply(id, body, ctx.node))
            {
                ctx.send_to_node(*sender, Message::GetLsnReply(reply));
            }
            false
        }
        Message::DeleteReplica(body) => {
            ctx.send_to_fm(Message::DeleteReplicaReply(ReplicaReplyBody {
                ft_id: id,
                cc_epoch: body.cc_epoch,
                replica: body.replica.clone(),
                code: ReplyCode::Success,
            }));
            false
        }
        _ if message.metadata().create_failover_unit_if_missing => {
            let Some(is_persisted) = persisted_flag(message) else {
                return false;
            };
            tracing::debug!(ft = %id, kind = ?message.kind(), "creating failover unit");
            locked.insert(FailoverUnit::new(id, ctx.node.id, is_persisted, ctx.now));
            true
        }
        _ => {
            tracing::debug!(ft = %id, kind = ?message.kind(), "message for unknown failover unit");
            false
        }
    }
}

fn persisted_flag(message: &Message) -> Option<bool> {
    match message {
        Message::DoReconfiguration(body) => Some(body.is_persisted),
        Message::AddPrimary(body) | Message::AddInstance(body) | Message::CreateReplica(body) => {
            Some(body.is_persisted)
        }
        _ => None,
    }
}

fn opens_replica(message: &Message) -> bool {
    matches!(
        message,
        Message::AddPrimary(_) | Message::AddInstance(_) | Message::CreateReplica(_)
    )
}

fn sender(from: &Endpoint) -> Option<NodeInstance> {
    match from {
        Endpoint::Node(node) => Some(*node),
        Endpoint::Fm | Endpoint::Fmm | Endpoint::Rap => None,
    }
}

fn is_admitted(ft: &FailoverUnit, from: &Endpoint, message: &Message) -> bool {
    use Message as M;
    match message {
        M::DoReconfiguration(body) => {
            ft.is_closed()
                || (ft.is_local_replica_open()
                    && !ft.is_close_pending()
                    && ft.can_process_do_reconfiguration(body))
        }
        M::CreateReplica(_)
        | M::GetLsn(_)
        | M::Deactivate(_)
        | M::Activate(_) => sender(from).is_some(),
        M::GetLsnReply(body) => ft.can_process_get_lsn_reply(body),
        M::DeactivateReply(body) => ft.can_process_deactivate_reply(body),
        M::ActivateReply(body) => ft.can_process_activate_reply(body),
        M::CreateReplicaReply(body) => ft.can_process_create_replica_reply(body),
        M::UpdateConfigurationReply(body) => ft.can_process_update_configuration_reply(body),
        M::CancelCatchupReplicaSetReply(body) => ft.can_process_cancel_catchup_reply(body),
        M::ReplicatorGetStatusReply(body) | M::ReplicatorUpdateEpochAndGetStatusReply(body) => {
            ft.can_process_replicator_status_reply(body)
        }
        M::ReplicatorBuildIdleReplicaReply(body) => ft.can_process_build_idle_replica_reply(body),
        M::ReplicaOpenReply(body) => ft.can_process_open_reply(body),
        M::ReplicaCloseReply(body) => ft.can_process_close_reply(body),
        M::ReplicaEndpointUpdatedReply(_) => ft.endpoint_publish().is_pending(),
        M::AddPrimary(_)
        | M::AddInstance(_)
        | M::AddReplica(_)
        | M::RemoveReplica(_)
        | M::DeleteReplica(_)
        | M::ReportFault(_)
        | M::ProxyReplicaEndpointUpdated(_)
        | M::ReadWriteStatusRevokedNotification(_) => true,
        _ => {
            tracing::debug!(ft = %ft.id(), kind = ?message.kind(), "message not handled by a failover unit");
            false
        }
    }
}

fn dispatch(
    ft: &mut FailoverUnit,
    from: &Endpoint,
    message: &Message,
    ctx: &mut FailoverUnitContext<'_>,
) {
    use Message as M;
    match message {
        M::DoReconfiguration(body) if ft.is_closed() => {
            if let Some(desc) = body.config.replica_on(ft.owner()) {
                ft.update_instance_for_closed_replica(desc, ctx);
            }
        }
        M::DoReconfiguration(body) => ft.do_reconfiguration(body, ctx),
        M::AddPrimary(body) => ft.open_new_replica(body, OpenReplyTarget::AddPrimary, ctx),
        M::AddInstance(body) => ft.open_new_replica(body, OpenReplyTarget::AddInstance, ctx),
        M::AddReplica(body) => ft.add_replica(body, ctx),
        M::RemoveReplica(body) => ft.remove_replica(body, ctx),
        M::DeleteReplica(body) => ft.delete_replica(body, ctx),
        M::ReplicaEndpointUpdatedReply(body) => ft.process_endpoint_updated_reply(body, ctx),

        M::CreateReplica(body) => {
            if let Some(node) = sender(from) {
                ft.open_new_replica(body, OpenReplyTarget::CreateReplica(node), ctx);
            }
        }
        M::GetLsn(body) => {
            if let Some(node) = sender(from) {
                ft.process_get_lsn(body, node, ctx);
            }
        }
        M::Deactivate(body) => {
            if let Some(node) = sender(from) {
                ft.process_deactivate(body, node, ctx);
            }
        }
        M::Activate(body) => {
            if let Some(node) = sender(from) {
                ft.process_activate(body, node, ctx);
            }
        }
        M::GetLsnReply(body) => ft.process_get_lsn_reply(body, ctx),
        M::DeactivateReply(body) => ft.process_deactivate_reply(body, ctx),
        M::ActivateReply(body) => ft.process_activate_reply(body, ctx),
        M::CreateReplicaReply(body) => ft.process_create_replica_reply(body, ctx),

        M::UpdateConfigurationReply(body) => ft.process_update_configuration_reply(body, ctx),
        M::CancelCatchupReplicaSetReply(body) => ft.process_cancel_catchup_reply(body, ctx),
        M::ReplicatorGetStatusReply(body) | M::ReplicatorUpdateEpochAndGetStatusReply(body) => {
            ft.process_replicator_status_reply(body, ctx)
        }
        M::ReplicatorBuildIdleReplicaReply(body) => {
            ft.process_build_idle_replica_reply(body, ctx)
        }
        M::ReplicaOpenReply(body) => ft.process_open_reply(body, ctx),
        M::ReplicaCloseReply(_) => ft.process_close_reply(ctx),
        M::ReportFault(body) => ft.report_fault(body, ctx),
        M::ProxyReplicaEndpointUpdated(body) => ft.process_proxy_endpoint_updated(body, ctx),
        M::ReadWriteStatusRevokedNotification(body) => ft.read_write_status_revoked(body, ctx),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ConfigurationBody;
    use crate::reconfiguration::ReconfigurationStage;
    use crate::test_support::*;
    use assert_matches::assert_matches;
    use ra_core::{FailoverConfig, NodeId, ReplicaDescription, ReplicaRole};
    use ra_entity::{CommitOutcome, EntityEntry, InMemoryLfumStore, LfumStore};
    use std::sync::Arc;

    fn entry(store: &Arc<InMemoryLfumStore>) -> Arc<EntityEntry<FailoverUnit>> {
        let store: Arc<dyn LfumStore> = store.clone();
        Arc::new(EntityEntry::new(ft_id(), store))
    }

    async fn seeded(ft: FailoverUnit) -> (Arc<InMemoryLfumStore>, Arc<EntityEntry<FailoverUnit>>) {
        let store = Arc::new(InMemoryLfumStore::new());
        let entry = entry(&store);
        let mut locked = entry.lock().await;
        locked.insert(ft);
        locked.commit().await.expect("seed commit");
        (store, entry)
    }

    fn three_replica_failover() -> Message {
        Message::DoReconfiguration(do_reconfiguration(
            epoch(0, 4, 11),
            epoch(0, 4, 33),
            &[
                (1, ReplicaRole::Secondary, ReplicaRole::Primary, true),
                (2, ReplicaRole::Primary, ReplicaRole::Idle, false),
                (3, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
            ],
        ))
    }

    fn three_replica_primary() -> FailoverUnit {
        let mut ft = open_ft(
            epoch(0, 4, 11),
            &[
                (1, ReplicaRole::Secondary, true),
                (2, ReplicaRole::Primary, true),
                (3, ReplicaRole::Secondary, true),
            ],
        );
        ft.sender_node = Some(node(2));
        ft
    }

    #[tokio::test]
    async fn test_failover_do_reconfiguration_starts_get_lsn() {
        let config = FailoverConfig::default();
        let (_store, entry) = seeded(three_replica_primary()).await;
        let mut ctx = context(&config);
        let mut locked = entry.lock().await;
        process_message(&mut locked, &Endpoint::Fm, &three_replica_failover(), &mut ctx);

        let ft = locked.get().expect("present");
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
        assert!(ft.sender_node().is_none());
        assert!(ctx
            .sent()
            .iter()
            .any(|e| e.target == Endpoint::Node(node(3)) && matches!(e.message, Message::GetLsn(_))));
        assert_matches!(locked.commit().await, Ok(CommitOutcome::Durable(_)));
    }

    #[tokio::test]
    async fn test_equal_epoch_redelivery_after_completion_is_noop() {
        let config = FailoverConfig::default();
        let ft = open_ft(
            epoch(0, 4, 33),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Idle, false),
                (3, ReplicaRole::Secondary, true),
            ],
        );
        let (store, entry) = seeded(ft).await;
        let writes = store.write_count();

        let stale = Message::DoReconfiguration(do_reconfiguration(
            epoch(0, 4, 11),
            epoch(0, 4, 12),
            &[(1, ReplicaRole::Secondary, ReplicaRole::Primary, true)],
        ));
        for message in [three_replica_failover(), stale] {
            let mut ctx = context(&config);
            let mut locked = entry.lock().await;
            process_message(&mut locked, &Endpoint::Fm, &message, &mut ctx);
            assert!(ctx.sent().is_empty());
            assert_matches!(locked.commit().await, Ok(CommitOutcome::NoOp));
        }
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_unknown_unit_answers_get_lsn_not_found() {
        let config = FailoverConfig::default();
        let store = Arc::new(InMemoryLfumStore::new());
        let entry = entry(&store);
        let mut ctx = context(&config);
        let mut locked = entry.lock().await;

        let body: ConfigurationBody = configuration(
            epoch(0, 4, 11),
            epoch(0, 4, 33),
            &[(1, ReplicaRole::Secondary, ReplicaRole::Secondary, true)],
        );
        process_message(&mut locked, &Endpoint::Node(node(3)), &Message::GetLsn(body), &mut ctx);

        assert!(!locked.is_present());
        assert_matches!(
            &ctx.sent()[0].message,
            Message::GetLsnReply(r) if r.reply.code == ReplyCode::NotFound
        );
        assert_matches!(locked.commit().await, Ok(CommitOutcome::NoOp));
    }

    #[tokio::test]
    async fn test_do_reconfiguration_for_unknown_unit_reports_dropped() {
        let config = FailoverConfig::default();
        let store = Arc::new(InMemoryLfumStore::new());
        let entry = entry(&store);
        let mut ctx = context(&config);
        let mut locked = entry.lock().await;
        process_message(&mut locked, &Endpoint::Fm, &three_replica_failover(), &mut ctx);

        let ft = locked.get().expect("created");
        assert!(ft.is_closed());
        assert!(ft.is_local_replica_dropped());
        assert!(ft.needs_fm_message());
        assert_eq!(ft.owner(), NodeId(1));
        assert_matches!(locked.commit().await, Ok(CommitOutcome::Durable(_)));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_add_primary_rejected_while_node_deactivated() {
        let config = FailoverConfig::default();
        let store = Arc::new(InMemoryLfumStore::new());
        let entry = entry(&store);
        let mut ctx = context(&config).with_node_activated(false);
        let mut locked = entry.lock().await;
        let add = Message::AddPrimary(replica_body(
            epoch(0, 1, 0),
            ReplicaDescription::new(node(1), 1, 1),
        ));
        process_message(&mut locked, &Endpoint::Fm, &add, &mut ctx);

        assert!(!locked.is_present());
        assert!(ctx.sent().is_empty());
        assert_matches!(locked.commit().await, Ok(CommitOutcome::NoOp));
    }

    #[tokio::test]
    async fn test_reply_from_fm_endpoint_not_treated_as_peer() {
        let config = FailoverConfig::default();
        let (_store, entry) = seeded(three_replica_primary()).await;
        let mut ctx = context(&config);
        let mut locked = entry.lock().await;
        let get_lsn = Message::GetLsn(configuration(
            epoch(0, 4, 11),
            epoch(0, 4, 33),
            &[(1, ReplicaRole::Secondary, ReplicaRole::Secondary, true)],
        ));
        process_message(&mut locked, &Endpoint::Fm, &get_lsn, &mut ctx);
        assert!(ctx.sent().is_empty());
        assert_matches!(locked.commit().await, Ok(CommitOutcome::NoOp));
    }
}
