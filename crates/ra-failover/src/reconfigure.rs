//! `DoReconfiguration` on the replica the FM picked as the new primary

use crate::context::FailoverUnitContext;
use crate::failover_unit::FailoverUnit;
use crate::messages::{ConfigurationBody, DoReconfigurationBody, Message};
use crate::reconfiguration::{ReconfigurationResult, ReconfigurationStage, ReconfigurationType};
use crate::replica::{ReplicaLsn, ReplicaMessageStage};
use ra_core::{ReplicaDescription, ReplicaRole, ReplicaState};

impl FailoverUnit {
    /// Whether a `DoReconfiguration` should be applied to an open unit
    ///
    /// Older epochs are stale. An equal epoch is only re-applied while the reconfiguration it
    /// started is still running; once finished, re-deliveries are ignored.
    pub fn can_process_do_reconfiguration(&self, body: &DoReconfigurationBody) -> bool {
        let Some(local) = self.local_replica() else {
            return false;
        };
        let Some(desc) = body.config.replica_on(self.owner) else {
            tracing::warn!(ft = %self.id, "local replica missing from DoReconfiguration");
            return false;
        };
        if local.instance_id > desc.instance_id {
            tracing::debug!(ft = %self.id, local = local.instance_id, incoming = desc.instance_id, "DoReconfiguration for an older instance");
            return false;
        }
        if self.cc_epoch.is_stale(&body.config.cc_epoch) {
            tracing::debug!(ft = %self.id, epoch = %self.cc_epoch, incoming = %body.config.cc_epoch, "stale DoReconfiguration");
            return false;
        }
        if !self.is_reconfiguring() && self.cc_epoch == body.config.cc_epoch {
            tracing::debug!(ft = %self.id, epoch = %self.cc_epoch, result = ?self.reconfiguration.result(), "DoReconfiguration already processed");
            return false;
        }
        true
    }

    /// Record a `DoReconfiguration` addressed to a closed unit
    ///
    /// The local replica is recorded as dropped at the FM's instance so the dropped report
    /// supersedes whatever the FM holds.
    pub fn update_instance_for_closed_replica(
        &mut self,
        desc: &ReplicaDescription,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let owner = self.owner;
        if let Some(local) = self.replicas.get(owner) {
            if local.instance_id > desc.instance_id {
                return;
            }
        }

        let replica = self.replicas.get_or_add(desc);
        replica.replica_id = desc.replica_id;
        replica.instance_id = desc.instance_id;
        replica.mark_dropped();
        self.local_replica_deleted = false;
        self.fm_message_state.on_dropped();
        self.touch(ctx.now);
        ctx.enable_update();
    }

    /// Start or continue the reconfiguration described by `body`
    pub fn do_reconfiguration(
        &mut self,
        body: &DoReconfigurationBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        self.fm_message_state.on_replica_up_acknowledged_implicitly();

        if self.try_abort_reconfiguration(&body.config, ctx) {
            return;
        }

        let Some(local_desc) = body.config.replica_on(self.owner).cloned() else {
            return;
        };

        self.cc_epoch = body.config.cc_epoch;
        self.touch(ctx.now);

        if !self.is_reconfiguring() {
            ctx.enable_update();

            let kind = self.identify_reconfiguration_type(body, &local_desc);
            self.update_reconfiguration_epochs(&body.config);

            let is_outgoing_primary = local_desc.pc_role == ReplicaRole::Primary
                && local_desc.cc_role == ReplicaRole::Secondary;
            let stage = self.reconfiguration.start(
                kind,
                is_outgoing_primary,
                body.phase0_duration_ms,
                ctx.now,
            );
            tracing::info!(ft = %self.id, epoch = %self.cc_epoch, kind = ?kind, stage = %stage, "reconfiguration started");

            if let Some(local) = self.local_replica_mut() {
                if local_desc.last_lsn != ra_core::INVALID_LSN {
                    local.lsn = ReplicaLsn::from_description(&local_desc);
                }
                local.pc_role = local_desc.pc_role;
                local.cc_role = local_desc.cc_role;
            }
            self.update_remote_replica_roles(&body.config);
            self.update_remote_replica_states(&body.config, true);

            self.sender_node = None;
            self.start_reconfiguration(ctx);
        } else {
            let changed = self.update_remote_replica_states(&body.config, false);
            if changed {
                self.mark_replicator_configuration_update_pending();
            }

            self.check_reconfiguration_progress(ctx);

            // Phase1 re-delivery only refreshes up/down; pending GetLSN requests are not resent
            let in_phase1 = self.reconfiguration_stage() == ReconfigurationStage::Phase1GetLsn;
            if changed && !in_phase1 && !self.is_close_pending() {
                self.resend_reconfiguration_messages(ctx);
            }
        }
    }

    fn identify_reconfiguration_type(
        &self,
        body: &DoReconfigurationBody,
        local_desc: &ReplicaDescription,
    ) -> ReconfigurationType {
        if body.phase0_duration_ms.is_some() {
            return ReconfigurationType::SwapPrimary;
        }

        let pc_primary = body
            .config
            .replicas
            .iter()
            .find(|r| r.pc_role == ReplicaRole::Primary)
            .map(|r| r.node.id);
        let cc_primary = body.config.cc_primary().map(|r| r.node.id);
        if pc_primary == cc_primary {
            return ReconfigurationType::Other;
        }

        if local_desc.cc_role == ReplicaRole::Secondary {
            return ReconfigurationType::SwapPrimary;
        }

        if self.reconfiguration.result() == ReconfigurationResult::AbortSwapPrimary {
            return ReconfigurationType::Other;
        }

        // A ready primary that stays primary never ran the swap it is now recovering from
        if self.reconfiguration.result() != ReconfigurationResult::ChangeConfiguration
            && self.is_local_ready_primary()
            && local_desc.cc_role == ReplicaRole::Primary
        {
            return ReconfigurationType::Other;
        }

        ReconfigurationType::Failover
    }

    fn update_reconfiguration_epochs(&mut self, body: &ConfigurationBody) {
        self.ic_epoch = ra_core::Epoch::invalid();
        self.pc_epoch = body.pc_epoch;

        let owner = self.owner;
        if let Some(local) = self.local_replica_mut() {
            local.ic_role = ReplicaRole::None;
        }
        if !self.is_local_ready_primary() {
            self.replicas
                .retain(|r| r.node.id == owner || !r.is_in_configuration());
        }
    }

    fn update_remote_replica_roles(&mut self, body: &ConfigurationBody) {
        let owner = self.owner;
        for desc in &body.replicas {
            if desc.node.id == owner {
                continue;
            }
            match self.replicas.get_mut(desc.node.id) {
                Some(replica) => {
                    replica.ic_role = ReplicaRole::None;
                    replica.pc_role = desc.pc_role;
                    replica.cc_role = desc.cc_role;
                }
                None => {
                    let replica = self.replicas.get_or_add(desc);
                    if desc.cc_role.is_in_configuration() && desc.state == ReplicaState::InBuild {
                        replica.state = ReplicaState::StandBy;
                    }
                }
            }
        }
    }

    /// Reconcile remote replica instances and up/down state with `body`
    ///
    /// Returns whether the replicator's view of the configuration changed.
    pub(crate) fn update_remote_replica_states(
        &mut self,
        body: &ConfigurationBody,
        is_starting: bool,
    ) -> bool {
        let stage = self.reconfiguration_stage();
        let is_catchup_stage = matches!(
            stage,
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup
        );
        let local_is_primary = self.is_local_primary();
        let remove_possible = stage != ReconfigurationStage::Phase1GetLsn && local_is_primary;
        let owner = self.owner;
        let mut changed = false;

        for desc in &body.replicas {
            if desc.node.id == owner {
                continue;
            }
            let Some(replica) = self.replicas.get_mut(desc.node.id) else {
                continue;
            };
            if replica.replicator_remove_pending {
                continue;
            }

            if replica.to_be_restarted {
                if replica.instance_id < desc.instance_id || (replica.is_up && !desc.is_up) {
                    replica.to_be_restarted = false;
                } else {
                    continue;
                }
            }

            if replica.instance_id < desc.instance_id {
                if replica.is_up
                    && (replica.state == ReplicaState::InBuild
                        || !replica.is_in_current_configuration())
                {
                    replica.is_up = false;
                    if replica.state == ReplicaState::InBuild && remove_possible {
                        replica.replicator_remove_pending = true;
                        replica.to_be_activated = false;
                        replica.to_be_deactivated = false;
                        if is_starting {
                            replica.message_stage = ReplicaMessageStage::None;
                        }
                    }
                } else {
                    replica.replica_id = desc.replica_id;
                    replica.instance_id = desc.instance_id;
                    replica.is_up = desc.is_up;
                    replica.state = ReplicaState::StandBy;
                    changed = true;
                }
            }

            if replica.instance_id != desc.instance_id {
                continue;
            }

            if desc.is_up {
                if replica.is_up
                    && replica.state == ReplicaState::StandBy
                    && desc.state == ReplicaState::InBuild
                {
                    if local_is_primary {
                        replica.state = ReplicaState::InCreate;
                        if matches!(
                            stage,
                            ReconfigurationStage::Phase3Deactivate
                                | ReconfigurationStage::Phase4Activate
                        ) && replica.message_stage == ReplicaMessageStage::None
                        {
                            replica.message_stage = ReplicaMessageStage::RAReplyPending;
                        }
                    }
                } else if desc.state == ReplicaState::Ready && replica.is_up {
                    replica.state = ReplicaState::Ready;
                } else if replica.is_up
                    && replica.state == ReplicaState::InBuild
                    && replica.to_be_activated
                    && desc.state == ReplicaState::InBuild
                    && is_starting
                {
                    replica.to_be_activated = false;
                    replica.to_be_deactivated = true;
                    replica.message_stage = ReplicaMessageStage::None;
                }
            } else if replica.is_up
                && stage != ReconfigurationStage::Phase1GetLsn
                && replica.pc_role == ReplicaRole::Secondary
                && matches!(replica.cc_role, ReplicaRole::Idle | ReplicaRole::None)
            {
                // Leaving the configuration; the UpdateConfiguration already sent stands
                tracing::debug!(ft = %self.id, replica = %desc.node, "outgoing secondary went down, dropping it");
                replica.mark_dropped();
            } else if replica.is_up {
                replica.is_up = false;
                changed = true;
                let is_idle_being_promoted = replica.pc_role == ReplicaRole::Idle
                    && replica.cc_role == ReplicaRole::Secondary
                    && is_catchup_stage;
                if remove_possible
                    && (replica.state == ReplicaState::InBuild || is_idle_being_promoted)
                {
                    replica.replicator_remove_pending = true;
                    replica.to_be_activated = false;
                    replica.to_be_deactivated = false;
                    changed = false;
                    if is_starting {
                        replica.message_stage = ReplicaMessageStage::None;
                    }
                }
            } else if desc.is_dropped() && !replica.is_dropped() {
                replica.mark_dropped();
            }
        }

        changed
    }

    pub(crate) fn mark_replicator_configuration_update_pending(&mut self) {
        match self.reconfiguration_stage() {
            ReconfigurationStage::Phase1GetLsn | ReconfigurationStage::AbortPhase0Demote => {}
            ReconfigurationStage::Phase3Deactivate | ReconfigurationStage::Phase4Activate => {
                if self.is_local_primary() {
                    self.replicator_configuration_update_pending = true;
                }
            }
            ReconfigurationStage::None
            | ReconfigurationStage::Phase0Demote
            | ReconfigurationStage::Phase2Catchup => {
                self.replicator_configuration_update_pending = true;
            }
        }
    }

    /// Cancel a demote superseded by a newer primary epoch
    ///
    /// Returns whether the incoming reconfiguration must wait for the abort.
    fn try_abort_reconfiguration(
        &mut self,
        incoming: &ConfigurationBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) -> bool {
        if !self.is_reconfiguring() {
            return false;
        }
        match self.reconfiguration_stage() {
            ReconfigurationStage::AbortPhase0Demote => true,
            ReconfigurationStage::Phase0Demote
                if incoming.cc_epoch.to_primary_epoch() > self.cc_epoch.to_primary_epoch() =>
            {
                self.reconfiguration
                    .start_phase(ReconfigurationStage::AbortPhase0Demote, ctx.now);
                tracing::info!(ft = %self.id, epoch = %self.cc_epoch, incoming = %incoming.cc_epoch, "aborting demote");
                if let Some(local) = self.local_replica_mut() {
                    local.message_stage = ReplicaMessageStage::RAProxyReplyPending;
                }
                ctx.enable_update();
                self.send_cancel_catchup(ctx);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn send_cancel_catchup(&self, ctx: &mut FailoverUnitContext<'_>) {
        if let Some(body) = self.local_replica_body() {
            ctx.send_to_rap(Message::CancelCatchupReplicaSet(body));
        }
    }
}
