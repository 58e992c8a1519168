//! Requests a new primary sends to the other replicas of the configuration

use crate::context::FailoverUnitContext;
use crate::failover_unit::FailoverUnit;
use crate::messages::{
    CloseMode, ConfigurationBody, DeactivateBody, GetLsnReplyBody, Message, ReplicaReplyBody,
    ReplyCode, UpdateConfigurationKind,
};
use crate::reconfiguration::ReconfigurationStage;
use crate::replica::ReplicaMessageStage;
use ra_core::{DeactivationInfo, FailoverUnitId, NodeInstance, ReplicaState};

/// `GetLSNReply` for a partition this node has no usable replica of
pub fn get_lsn_not_found_reply(
    ft_id: FailoverUnitId,
    body: &ConfigurationBody,
    owner: NodeInstance,
) -> Option<GetLsnReplyBody> {
    let replica = body.replica_on(owner.id)?.clone();
    Some(GetLsnReplyBody {
        reply: ReplicaReplyBody {
            ft_id,
            cc_epoch: body.cc_epoch,
            replica,
            code: ReplyCode::NotFound,
        },
        deactivation_info: DeactivationInfo::Dropped,
    })
}

impl FailoverUnit {
    fn is_stale_request(&self, body: &ConfigurationBody) -> bool {
        if self.cc_epoch.is_stale(&body.cc_epoch) {
            tracing::debug!(ft = %self.id, epoch = %self.cc_epoch, incoming = %body.cc_epoch, "stale request from primary");
            return true;
        }
        false
    }

    /// Report the local replica's progress to a new primary
    ///
    /// The local replica adopts the incoming configuration and the replicator is asked for its
    /// progress; the reply goes out when the replicator answers.
    pub fn process_get_lsn(
        &mut self,
        body: &ConfigurationBody,
        from: NodeInstance,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let unusable = !self.is_open()
            || self.is_local_replica_dropped()
            || self.deactivation_info.is_dropped();
        if unusable {
            if let Some(reply) = get_lsn_not_found_reply(self.id, body, ctx.node) {
                ctx.send_to_node(from, Message::GetLsnReply(reply));
            }
            return;
        }
        if !self.is_local_replica_open() || self.is_close_pending() || self.is_stale_request(body) {
            return;
        }

        if body.cc_epoch > self.cc_epoch {
            self.copy_cc_to_pc();
            self.cc_epoch = body.cc_epoch;
            for desc in &body.replicas {
                let replica = self.replicas.get_or_add(desc);
                replica.cc_role = desc.cc_role;
            }
            self.touch(ctx.now);
            ctx.enable_update();
        }

        self.sender_node = Some(from);
        ctx.send_to_rap(Message::ReplicatorUpdateEpochAndGetStatus(
            self.configuration_body(),
        ));
    }

    /// Whether a replicator status reply is awaited
    pub fn can_process_replicator_status_reply(&self, body: &ReplicaReplyBody) -> bool {
        if !self.is_local_replica_open() || self.is_close_pending() {
            return false;
        }
        if !self
            .local_replica()
            .is_some_and(|r| r.instance_id == body.replica.instance_id)
        {
            return false;
        }
        self.sender_node.is_some()
            || (self.reconfiguration_stage() == ReconfigurationStage::Phase1GetLsn
                && self.local_replica().is_some_and(|r| {
                    r.message_stage == ReplicaMessageStage::RAProxyReplyPending
                }))
    }

    /// Route a replicator status reply to the primary that asked or to the running Phase1
    pub fn process_replicator_status_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        if let Some(sender) = self.sender_node.take() {
            let reply = GetLsnReplyBody {
                reply: ReplicaReplyBody {
                    ft_id: self.id,
                    cc_epoch: self.cc_epoch,
                    replica: body.replica.clone(),
                    code: body.code,
                },
                deactivation_info: self.deactivation_info,
            };
            ctx.send_to_node(sender, Message::GetLsnReply(reply));
            return;
        }
        self.process_local_status_reply(body, ctx);
    }

    /// Deactivate the local replica for a new primary
    ///
    /// A forced deactivate closes the replica and answers once the close completes.
    pub fn process_deactivate(
        &mut self,
        body: &DeactivateBody,
        from: NodeInstance,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        if self.close_mode == Some(CloseMode::Deactivate) {
            self.sender_node = Some(from);
            return;
        }
        if !self.is_local_replica_open() || self.is_close_pending() {
            return;
        }
        if self.is_stale_request(&body.config) {
            return;
        }

        if body.is_force {
            self.sender_node = Some(from);
            self.start_close_local_replica(CloseMode::Deactivate, ctx);
            return;
        }

        self.adopt_configuration(&body.config);
        self.ic_epoch = body.config.cc_epoch;
        for replica in self.replicas.iter_mut() {
            replica.ic_role = replica.cc_role;
        }
        if body.deactivation_info.is_valid()
            && body.deactivation_info.epoch() >= self.deactivation_info.epoch()
        {
            self.deactivation_info = body.deactivation_info;
        }
        self.promote_local_if_ready(&body.config);
        self.touch(ctx.now);
        ctx.enable_update();

        if let Some(reply) = self.local_reply(ReplyCode::Success) {
            ctx.send_to_node(from, Message::DeactivateReply(reply));
        }
    }

    /// Activate the local replica in the new configuration
    pub fn process_activate(
        &mut self,
        body: &ConfigurationBody,
        from: NodeInstance,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        if !self.is_local_replica_open() || self.is_close_pending() {
            return;
        }
        if self.is_stale_request(body) {
            return;
        }

        let previous_role = self.local_replica().map(|r| r.cc_role);
        self.adopt_configuration(body);
        self.reset_reconfiguration_states();
        if let Some(local) = self.local_replica_mut() {
            if local.state == ReplicaState::InBuild {
                local.state = ReplicaState::Ready;
            }
        }
        self.touch(ctx.now);
        ctx.enable_update();

        if self.local_replica().map(|r| r.cc_role) != previous_role {
            self.send_update_configuration(UpdateConfigurationKind::UpdateRoles, ctx);
        }
        if let Some(reply) = self.local_reply(ReplyCode::Success) {
            ctx.send_to_node(from, Message::ActivateReply(reply));
        }
    }

    fn promote_local_if_ready(&mut self, body: &ConfigurationBody) {
        let ready = body
            .replica_on(self.owner)
            .is_some_and(|d| d.state == ReplicaState::Ready);
        if let Some(local) = self.local_replica_mut() {
            if ready && local.state == ReplicaState::InBuild {
                local.state = ReplicaState::Ready;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Endpoint;
    use crate::test_support::*;
    use assert_matches::assert_matches;
    use ra_core::{FailoverConfig, NodeId, ReplicaDescription, ReplicaRole};

    fn secondary() -> FailoverUnit {
        open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Secondary, true),
                (2, ReplicaRole::Primary, true),
            ],
        )
    }

    fn failover_config() -> ConfigurationBody {
        configuration(
            epoch(4, 1, 1),
            epoch(4, 2, 0),
            &[
                (1, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
                (2, ReplicaRole::Primary, ReplicaRole::None, false),
                (3, ReplicaRole::Secondary, ReplicaRole::Primary, true),
            ],
        )
    }

    #[test]
    fn test_get_lsn_adopts_epoch_and_replies_after_replicator() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = secondary();
        ft.process_get_lsn(&failover_config(), node(3), &mut ctx);

        assert_eq!(ft.pc_epoch(), epoch(4, 1, 1));
        assert_eq!(ft.cc_epoch(), epoch(4, 2, 0));
        assert_eq!(ft.sender_node(), Some(node(3)));
        assert_matches!(
            ctx.sent()[0].message,
            Message::ReplicatorUpdateEpochAndGetStatus(_)
        );

        let mut ctx = context(&config);
        let status = ReplicaReplyBody {
            ft_id: ft_id(),
            cc_epoch: epoch(4, 2, 0),
            replica: ReplicaDescription::new(node(1), 1, 1).with_lsn(3, 42),
            code: ReplyCode::Success,
        };
        assert!(ft.can_process_replicator_status_reply(&status));
        ft.process_replicator_status_reply(&status, &mut ctx);

        let sent = ctx.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, Endpoint::Node(node(3)));
        assert_matches!(&sent[0].message, Message::GetLsnReply(r) if r.reply.replica.last_lsn == 42);
        assert!(ft.sender_node().is_none());
    }

    #[test]
    fn test_get_lsn_on_dropped_replica_is_not_found() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = secondary();
        ft.deactivation_info = DeactivationInfo::Dropped;
        ft.process_get_lsn(&failover_config(), node(3), &mut ctx);

        assert_matches!(
            &ctx.sent()[0].message,
            Message::GetLsnReply(r) if r.reply.code == ReplyCode::NotFound
                && r.deactivation_info.is_dropped()
        );
        assert_eq!(ft.cc_epoch(), epoch(4, 1, 1));
    }

    #[test]
    fn test_stale_get_lsn_ignored() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = secondary();
        ft.cc_epoch = epoch(4, 3, 0);
        ft.process_get_lsn(&failover_config(), node(3), &mut ctx);
        assert!(ctx.sent().is_empty());
        assert!(ft.sender_node().is_none());
    }

    #[test]
    fn test_deactivate_records_intermediate_configuration() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = secondary();
        let info = DeactivationInfo::new(epoch(4, 2, 0), 42);
        let body = DeactivateBody {
            config: failover_config(),
            deactivation_info: info,
            is_force: false,
        };
        ft.process_deactivate(&body, node(3), &mut ctx);

        assert_eq!(ft.ic_epoch(), epoch(4, 2, 0));
        assert_eq!(ft.deactivation_info(), info);
        assert_eq!(
            ft.replicas().get(NodeId(3)).map(|r| r.ic_role),
            Some(ReplicaRole::Primary)
        );
        assert_matches!(&ctx.sent()[0].message, Message::DeactivateReply(r) if r.cc_epoch == epoch(4, 2, 0));
    }

    #[test]
    fn test_activate_resets_reconfiguration_state() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = secondary();
        let body = configuration(
            epoch(4, 1, 1),
            epoch(4, 2, 0),
            &[
                (1, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
                (3, ReplicaRole::Secondary, ReplicaRole::Primary, true),
            ],
        );
        ft.process_activate(&body, node(3), &mut ctx);

        assert!(ft.pc_epoch().is_invalid());
        assert_eq!(ft.cc_epoch(), epoch(4, 2, 0));
        assert!(!ctx
            .sent()
            .iter()
            .any(|e| matches!(e.message, Message::UpdateConfiguration(_))));
        assert_matches!(ctx.sent()[0].message, Message::ActivateReply(_));
    }
}
