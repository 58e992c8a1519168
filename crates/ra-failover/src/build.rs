//! Idle replica build driven by the primary
//!
//! `AddReplica` creates the replica on its node (`CreateReplica`), then the local replicator
//! copies state to it (`ReplicatorBuildIdleReplica`). The FM gets `AddReplicaReply` once the
//! replica is ready. `RemoveReplica` drops an idle replica again.

use crate::context::FailoverUnitContext;
use crate::failover_unit::FailoverUnit;
use crate::messages::{Message, ReplicaBody, ReplicaReplyBody, ReplyCode};
use crate::replica::{Replica, ReplicaMessageStage};
use ra_core::{NodeId, ReplicaDescription, ReplicaRole, ReplicaState};

impl FailoverUnit {
    fn can_build(&self) -> bool {
        self.is_local_replica_open() && !self.is_close_pending() && self.is_local_ready_primary()
    }

    /// Start building an idle replica on the FM's request
    pub fn add_replica(&mut self, body: &ReplicaBody, ctx: &mut FailoverUnitContext<'_>) {
        if !self.can_build() || body.replica.node.id == self.owner {
            return;
        }
        if self.cc_epoch.is_stale(&body.cc_epoch) {
            tracing::debug!(ft = %self.id, epoch = %self.cc_epoch, incoming = %body.cc_epoch, "stale AddReplica");
            return;
        }

        let desc = &body.replica;
        if let Some(existing) = self.replicas.get(desc.node.id) {
            if existing.instance_id > desc.instance_id {
                return;
            }
            if existing.instance_id == desc.instance_id && !existing.is_dropped() {
                if existing.state == ReplicaState::Ready {
                    let reply = self.build_reply(existing.description(), ReplyCode::Success);
                    ctx.send_to_fm(Message::AddReplicaReply(reply));
                }
                return;
            }
            if existing.is_in_configuration() {
                tracing::debug!(ft = %self.id, node = %desc.node, "AddReplica for a configuration member");
                return;
            }
            self.replicas.remove(desc.node.id);
        }

        let mut replica = Replica::from_description(desc);
        replica.pc_role = ReplicaRole::None;
        replica.cc_role = ReplicaRole::Idle;
        replica.state = ReplicaState::InCreate;
        replica.is_up = true;
        replica.message_stage = ReplicaMessageStage::RAReplyPending;
        let create = self.replica_body(&replica);
        self.replicas.add(replica);

        tracing::info!(ft = %self.id, node = %desc.node, instance = desc.instance_id, "building idle replica");
        self.touch(ctx.now);
        ctx.enable_update();
        ctx.send_to_node(desc.node, Message::CreateReplica(create));
    }

    /// Whether a `CreateReplicaReply` answers an outstanding create
    pub fn can_process_create_replica_reply(&self, body: &ReplicaReplyBody) -> bool {
        self.can_build()
            && self.replicas.get(body.replica.node.id).is_some_and(|r| {
                r.state == ReplicaState::InCreate
                    && r.instance_id == body.replica.instance_id
                    && r.message_stage == ReplicaMessageStage::RAReplyPending
            })
    }

    /// Move a created replica to build, or fail the add
    pub fn process_create_replica_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let node = body.replica.node.id;
        if !body.code.is_success() {
            self.fail_build(node, body.code, ctx);
            return;
        }
        let Some(replica) = self.replicas.get_mut(node) else {
            return;
        };
        replica.state = ReplicaState::InBuild;
        replica.message_stage = ReplicaMessageStage::RAProxyReplyPending;
        let build = self.replicas.get(node).map(|r| self.replica_body(r));

        ctx.enable_update();
        if let Some(build) = build {
            ctx.send_to_rap(Message::ReplicatorBuildIdleReplica(build));
        }
    }

    /// Whether a build reply answers an outstanding build
    pub fn can_process_build_idle_replica_reply(&self, body: &ReplicaReplyBody) -> bool {
        self.can_build()
            && self.replicas.get(body.replica.node.id).is_some_and(|r| {
                r.state == ReplicaState::InBuild
                    && r.cc_role == ReplicaRole::Idle
                    && r.instance_id == body.replica.instance_id
                    && r.message_stage == ReplicaMessageStage::RAProxyReplyPending
            })
    }

    /// Finish a build
    ///
    /// A failed build stays pending and is retried by the resend pass.
    pub fn process_build_idle_replica_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let node = body.replica.node.id;
        match body.code {
            ReplyCode::Success => {}
            ReplyCode::NotFound => {
                self.fail_build(node, body.code, ctx);
                return;
            }
            _ => {
                tracing::debug!(ft = %self.id, node = %body.replica.node, code = ?body.code, "idle replica build failed");
                return;
            }
        }
        let Some(replica) = self.replicas.get_mut(node) else {
            return;
        };
        replica.state = ReplicaState::Ready;
        replica.message_stage = ReplicaMessageStage::None;
        let desc = replica.description();

        tracing::info!(ft = %self.id, node = %desc.node, "idle replica built");
        ctx.enable_update();
        let reply = self.build_reply(desc, ReplyCode::Success);
        ctx.send_to_fm(Message::AddReplicaReply(reply));
    }

    fn fail_build(
        &mut self,
        node: NodeId,
        code: ReplyCode,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let Some(replica) = self.replicas.get_mut(node) else {
            return;
        };
        replica.mark_dropped();
        let desc = replica.description();
        tracing::warn!(ft = %self.id, node = %desc.node, code = ?code, "idle replica build abandoned");
        ctx.enable_update();
        let reply = self.build_reply(desc, code);
        ctx.send_to_fm(Message::AddReplicaReply(reply));
    }

    /// Drop an idle replica on the FM's request
    pub fn remove_replica(&mut self, body: &ReplicaBody, ctx: &mut FailoverUnitContext<'_>) {
        if !self.is_local_replica_open() || self.cc_epoch.is_stale(&body.cc_epoch) {
            return;
        }
        let node = body.replica.node.id;
        let removable = self.replicas.get(node).is_some_and(|r| {
            node != self.owner
                && !r.is_in_configuration()
                && r.instance_id <= body.replica.instance_id
        });
        if removable {
            if let Some(mut replica) = self.replicas.remove(node) {
                replica.mark_dropped();
                ctx.send_to_rap(Message::ReplicatorRemoveIdleReplica(
                    self.replica_body(&replica),
                ));
            }
            self.touch(ctx.now);
            ctx.enable_update();
        } else if self
            .replicas
            .get(node)
            .is_some_and(|r| r.is_in_configuration())
        {
            return;
        }

        let reply = self.build_reply(body.replica.clone(), ReplyCode::Success);
        ctx.send_to_fm(Message::RemoveReplicaReply(reply));
    }

    /// Whether an idle replica build is outstanding
    pub fn is_build_pending(&self) -> bool {
        self.replicas
            .idle()
            .any(|r| r.message_stage != ReplicaMessageStage::None)
    }

    pub(crate) fn resend_build_messages(&self, ctx: &mut FailoverUnitContext<'_>) {
        if !self.can_build() {
            return;
        }
        for replica in self.replicas.idle() {
            match (replica.state, replica.message_stage) {
                (ReplicaState::InCreate, ReplicaMessageStage::RAReplyPending) => {
                    ctx.send_to_node(replica.node, Message::CreateReplica(self.replica_body(replica)));
                }
                (ReplicaState::InBuild, ReplicaMessageStage::RAProxyReplyPending) => {
                    ctx.send_to_rap(Message::ReplicatorBuildIdleReplica(self.replica_body(replica)));
                }
                _ => {}
            }
        }
    }

    fn build_reply(&self, replica: ReplicaDescription, code: ReplyCode) -> ReplicaReplyBody {
        ReplicaReplyBody {
            ft_id: self.id,
            cc_epoch: self.cc_epoch,
            replica,
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Endpoint;
    use crate::test_support::*;
    use assert_matches::assert_matches;
    use ra_core::FailoverConfig;

    fn primary() -> FailoverUnit {
        open_ft(
            epoch(2, 1, 0),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, true),
            ],
        )
    }

    fn add_body() -> ReplicaBody {
        replica_body(epoch(2, 1, 0), ReplicaDescription::new(node(3), 30, 1))
    }

    fn reply_from(node_id: u64, code: ReplyCode) -> ReplicaReplyBody {
        ReplicaReplyBody {
            ft_id: ft_id(),
            cc_epoch: epoch(2, 1, 0),
            replica: ReplicaDescription::new(node(node_id), 30, 1),
            code,
        }
    }

    #[test]
    fn test_build_flow() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = primary();
        ft.add_replica(&add_body(), &mut ctx);

        assert!(ft.is_build_pending());
        assert_eq!(ctx.sent()[0].target, Endpoint::Node(node(3)));
        assert_matches!(ctx.sent()[0].message, Message::CreateReplica(_));

        let mut ctx = context(&config);
        let created = reply_from(3, ReplyCode::Success);
        assert!(ft.can_process_create_replica_reply(&created));
        ft.process_create_replica_reply(&created, &mut ctx);
        assert_matches!(ctx.sent()[0].message, Message::ReplicatorBuildIdleReplica(_));
        assert!(!ft.can_process_create_replica_reply(&created));

        let mut ctx = context(&config);
        let built = reply_from(3, ReplyCode::Success);
        assert!(ft.can_process_build_idle_replica_reply(&built));
        ft.process_build_idle_replica_reply(&built, &mut ctx);

        assert!(!ft.is_build_pending());
        assert_eq!(
            ft.replicas().get(NodeId(3)).map(|r| r.state),
            Some(ReplicaState::Ready)
        );
        assert_matches!(&ctx.sent()[0].message, Message::AddReplicaReply(r) if r.code.is_success());
    }

    #[test]
    fn test_add_replica_for_ready_replica_replies_again() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = primary();
        ft.add_replica(&add_body(), &mut ctx);
        ft.process_create_replica_reply(&reply_from(3, ReplyCode::Success), &mut ctx);
        ft.process_build_idle_replica_reply(&reply_from(3, ReplyCode::Success), &mut ctx);

        let mut ctx = context(&config);
        ft.add_replica(&add_body(), &mut ctx);
        let sent = ctx.sent();
        assert_eq!(sent.len(), 1);
        assert_matches!(sent[0].message, Message::AddReplicaReply(_));
    }

    #[test]
    fn test_failed_create_drops_replica() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = primary();
        ft.add_replica(&add_body(), &mut ctx);
        ft.process_create_replica_reply(&reply_from(3, ReplyCode::NotFound), &mut ctx);

        assert!(ft.replicas().get(NodeId(3)).is_some_and(Replica::is_dropped));
        assert!(!ft.is_build_pending());
    }

    #[test]
    fn test_remove_idle_replica() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = primary();
        ft.add_replica(&add_body(), &mut ctx);

        let mut ctx = context(&config);
        ft.remove_replica(&add_body(), &mut ctx);
        assert!(ft.replicas().get(NodeId(3)).is_none());
        assert!(ctx
            .sent()
            .iter()
            .any(|e| matches!(e.message, Message::RemoveReplicaReply(_))));

        let mut ctx = context(&config);
        let member = replica_body(epoch(2, 1, 0), ReplicaDescription::new(node(2), 2, 1));
        ft.remove_replica(&member, &mut ctx);
        assert!(ft.replicas().get(NodeId(2)).is_some());
        assert!(ctx.sent().is_empty());
    }
}
