//! Reconfiguration phases driven by the new primary
//!
//! `Phase0_Demote` (swap only) → `Phase1_GetLSN` (failover only) → `Phase2_Catchup` →
//! `Phase3_Deactivate` → `Phase4_Activate` → completion. Every phase is re-entrant: the retry
//! pass resends whatever the current phase is still waiting on, and every reply re-checks
//! progress.

use crate::context::FailoverUnitContext;
use crate::failover_unit::FailoverUnit;
use crate::messages::{
    CloseMode, DeactivateBody, DoReconfigurationBody, GetLsnReplyBody, Message,
    ReplicaReplyBody, ReplyCode, UpdateConfigurationBody, UpdateConfigurationKind,
    UpdateConfigurationReplyBody,
};
use crate::reconfiguration::{ReconfigurationResult, ReconfigurationStage};
use crate::replica::{Replica, ReplicaLsn, ReplicaMessageStage};
use crate::retryable_error::{RetryableErrorAction, RetryableErrorStateName};
use ra_core::{
    DeactivationInfo, FailoverConfig, NodeId, ReplicaDescription, ReplicaRole, ReplicaState,
    INVALID_LSN,
};

/// Progress counts of one configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadQuorum {
    /// Replicas in the configuration
    pub count: usize,
    /// Replicas that finished
    pub completed: usize,
    /// Up replicas still expected to answer
    pub up_waiting: usize,
    /// Down replicas that may still answer once up
    pub down_waiting: usize,
}

impl ReadQuorum {
    /// Whether fewer than a read quorum finished
    pub fn is_below_quorum(&self) -> bool {
        self.completed < (self.count + 1) / 2
    }

    /// Replicas still expected to answer
    pub fn waiting(&self) -> usize {
        self.up_waiting + self.down_waiting
    }
}

impl FailoverUnit {
    // ========================================================================
    // Start and progress
    // ========================================================================

    pub(crate) fn start_reconfiguration(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        self.endpoint_publish.clear();
        self.message_retry_active = true;

        if self.reconfiguration_stage() == ReconfigurationStage::Phase1GetLsn {
            self.start_phase1_get_lsn(ctx);
        } else {
            self.update_local_state_on_phase2();
            self.resend_reconfiguration_messages(ctx);
        }
    }

    /// Advance the current phase if everything it waits on has answered
    pub fn check_reconfiguration_progress(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        match self.reconfiguration_stage() {
            ReconfigurationStage::Phase1GetLsn => self.check_phase1_progress(ctx),
            ReconfigurationStage::Phase3Deactivate => self.check_phase3_progress(ctx),
            ReconfigurationStage::Phase4Activate => self.check_phase4_progress(ctx),
            _ => {}
        }
    }

    // ========================================================================
    // Phase1: GetLSN
    // ========================================================================

    fn start_phase1_get_lsn(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let owner = self.owner;
        for replica in self.replicas.configuration_remote_mut(owner) {
            replica.lsn = ReplicaLsn::NotSet;
            replica.deactivation_info = DeactivationInfo::Invalid;
            replica.message_stage = if replica.is_dropped() {
                ReplicaMessageStage::None
            } else {
                ReplicaMessageStage::RAReplyPending
            };
        }
        if let Some(local) = self.local_replica_mut() {
            local.lsn = ReplicaLsn::NotSet;
            local.message_stage = ReplicaMessageStage::RAProxyReplyPending;
        }

        self.resend_reconfiguration_messages(ctx);
        self.check_phase1_progress(ctx);
    }

    /// Progress counts of the previous (`previous = true`) or current configuration
    pub fn phase1_read_quorum(&self, previous: bool) -> ReadQuorum {
        let mut quorum = ReadQuorum::default();
        let members = self.replicas.configuration(self.owner).filter(|r| {
            if previous {
                r.is_in_previous_configuration()
            } else {
                r.is_in_current_configuration()
            }
        });
        for replica in members {
            quorum.count += 1;
            match replica.lsn {
                ReplicaLsn::Known { .. } => quorum.completed += 1,
                ReplicaLsn::Unknown => {}
                ReplicaLsn::NotSet if replica.is_dropped() => {}
                ReplicaLsn::NotSet if replica.is_up => quorum.up_waiting += 1,
                ReplicaLsn::NotSet => quorum.down_waiting += 1,
            }
        }
        quorum
    }

    fn check_phase1_progress(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let pc = if self.pc_epoch.is_valid() {
            self.phase1_read_quorum(true)
        } else {
            ReadQuorum::default()
        };
        let cc = self.phase1_read_quorum(false);

        let wait_duration = ctx.config.remote_replica_progress_query_wait_duration();
        if pc.up_waiting + cc.up_waiting > 0
            && self.reconfiguration.phase_elapsed(ctx.now) < wait_duration
        {
            return;
        }

        if pc.is_below_quorum() || cc.is_below_quorum() {
            if pc.waiting() + cc.waiting() > 0 {
                return;
            }
            if self.pc_epoch.data_loss_number == self.cc_epoch.data_loss_number {
                self.report_data_loss(ctx);
                return;
            }
        }

        self.finish_phase1_get_lsn(ctx);
    }

    fn report_data_loss(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let data_loss_number = self.cc_epoch.data_loss_number;
        if self.reconfiguration.data_loss_reported() == Some(data_loss_number) {
            return;
        }
        tracing::warn!(ft = %self.id, epoch = %self.cc_epoch, "read quorum lost; reporting data loss");
        self.reconfiguration.set_data_loss_reported(data_loss_number);
        ctx.enable_update();
        ctx.send_to_fm(Message::DataLossReport(self.configuration_body()));
    }

    fn finish_phase1_get_lsn(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        if !self.local_replica().is_some_and(|r| r.lsn.is_set()) {
            let mode = self.restart_or_drop_mode();
            tracing::warn!(ft = %self.id, mode = ?mode, "local replica did not report progress");
            self.start_close_local_replica(mode, ctx);
            return;
        }

        let Some(primary) = self.find_primary(ctx.config) else {
            return;
        };

        if primary == self.owner {
            self.start_phase2_catchup_on_failover(ctx);
        } else {
            tracing::info!(ft = %self.id, epoch = %self.cc_epoch, primary = %primary, "another replica should be primary");
            ctx.send_to_fm(Message::ChangeConfiguration(self.configuration_body()));
            self.reconfiguration
                .finish(ReconfigurationResult::ChangeConfiguration);
            self.revert_configuration();
            self.message_retry_active = false;
            ctx.enable_update();
        }
    }

    /// Elect the primary from the collected progress
    ///
    /// `None` means the best candidate is down and the election has to wait.
    pub fn find_primary(&self, config: &FailoverConfig) -> Option<NodeId> {
        let members: Vec<&Replica> = self
            .replicas
            .configuration(self.owner)
            .filter(|r| !r.is_dropped())
            .collect();
        let mut eligible: Vec<&Replica> = members
            .iter()
            .copied()
            .filter(|r| r.lsn.is_known())
            .collect();
        if eligible.is_empty() {
            eligible = members.into_iter().filter(|r| r.lsn.is_set()).collect();
        }

        if config.is_deactivation_info_enabled
            && !eligible.is_empty()
            && eligible
                .iter()
                .all(|r| self.deactivation_info_of(r).is_valid())
        {
            let newest = eligible
                .iter()
                .map(|r| self.deactivation_info_of(r).epoch())
                .max()?;
            eligible.retain(|r| self.deactivation_info_of(r).epoch() == newest);
        }

        let mut winner: Option<&Replica> = None;
        for replica in eligible.iter().copied().filter(|r| r.is_up) {
            if winner.map_or(true, |w| replica.lsn.last() > w.lsn.last()) {
                winner = Some(replica);
            }
        }
        let mut winner = winner?;

        if self.reconfiguration.is_failover() && winner.node_id() == self.owner {
            let local_first = winner.lsn.first();
            let someone_lags = eligible
                .iter()
                .any(|r| r.lsn.last() < local_first - 1);
            if someone_lags {
                for replica in eligible.iter().copied().filter(|r| r.is_up) {
                    if replica.lsn.last() == winner.lsn.last()
                        && replica.lsn.first() < winner.lsn.first()
                    {
                        winner = replica;
                    }
                }
            }
        }

        Some(winner.node_id())
    }

    fn deactivation_info_of(&self, replica: &Replica) -> DeactivationInfo {
        if replica.node_id() == self.owner {
            self.deactivation_info
        } else {
            replica.deactivation_info
        }
    }

    /// Whether a `GetLSN` reply belongs to the running Phase1
    ///
    /// The replier's epoch is not compared: a replica that has not adopted the new epoch yet
    /// still reports usable progress. A second reply finds nothing pending and is ignored.
    pub fn can_process_get_lsn_reply(&self, body: &GetLsnReplyBody) -> bool {
        if !matches!(body.reply.code, ReplyCode::Success | ReplyCode::NotFound) {
            return false;
        }
        if !self.is_local_replica_open() || self.is_close_pending() {
            return false;
        }
        if self.reconfiguration_stage() != ReconfigurationStage::Phase1GetLsn {
            return false;
        }
        self.replicas
            .get(body.reply.replica.node.id)
            .is_some_and(|r| {
                r.message_stage == ReplicaMessageStage::RAReplyPending
                    && r.instance_id == body.reply.replica.instance_id
            })
    }

    /// Record a remote replica's progress
    pub fn process_get_lsn_reply(
        &mut self,
        body: &GetLsnReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let Some(replica) = self.replicas.get_mut(body.reply.replica.node.id) else {
            return;
        };
        match body.reply.code {
            ReplyCode::NotFound => {
                replica.lsn = ReplicaLsn::Unknown;
                replica.deactivation_info = DeactivationInfo::Dropped;
            }
            _ if body.reply.replica.is_dropped() => {
                replica.mark_dropped();
                ctx.enable_update();
            }
            _ => {
                replica.lsn = ReplicaLsn::from_description(&body.reply.replica);
                replica.deactivation_info = body.deactivation_info;
            }
        }
        replica.message_stage = ReplicaMessageStage::None;

        self.check_phase1_progress(ctx);
    }

    /// Record the local replica's progress reported by the replicator
    pub(crate) fn process_local_status_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        if !body.code.is_success() {
            return;
        }
        let deactivation_info = self.deactivation_info;
        if let Some(local) = self.local_replica_mut() {
            local.lsn = ReplicaLsn::from_description(&body.replica);
            local.deactivation_info = deactivation_info;
            local.message_stage = ReplicaMessageStage::None;
        }
        self.check_phase1_progress(ctx);
    }

    // ========================================================================
    // Phase0 / Phase2: catch-up
    // ========================================================================

    fn start_phase2_catchup_on_failover(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        self.reconfiguration
            .start_phase(ReconfigurationStage::Phase2Catchup, ctx.now);
        tracing::info!(ft = %self.id, epoch = %self.cc_epoch, "GetLSN complete; catching up");
        self.update_local_state_on_phase2();

        let owner = self.owner;
        let local_lsn = self
            .local_replica()
            .map(|r| r.lsn)
            .unwrap_or_default();
        let restart: Vec<NodeId> = self
            .replicas
            .configuration_remote(owner)
            .filter(|r| is_restart_needed_after_get_lsn(&local_lsn, r))
            .map(Replica::node_id)
            .collect();
        for replica in self.replicas.configuration_remote_mut(owner) {
            replica.message_stage = ReplicaMessageStage::None;
            if replica.lsn == ReplicaLsn::Unknown {
                replica.lsn = ReplicaLsn::NotSet;
            }
            if restart.contains(&replica.node_id()) {
                replica.to_be_restarted = true;
            }
        }

        ctx.enable_update();
        self.resend_reconfiguration_messages(ctx);
    }

    fn update_local_state_on_phase2(&mut self) {
        self.retryable_error
            .enter(RetryableErrorStateName::ReplicaChangeRoleAtCatchup);

        let local_lsn = self.local_replica().map(|r| r.lsn).unwrap_or_default();
        if self.has_primary_changed() && local_lsn.is_set() {
            let is_new_replica = self.deactivation_info.is_dropped();
            let was_behind = local_lsn.last() < self.deactivation_info.catchup_lsn();
            if is_new_replica || was_behind {
                self.deactivation_info = DeactivationInfo::new(self.cc_epoch, local_lsn.last());
            }
        }

        self.replicator_configuration_update_pending = false;

        let mut reset_fm = false;
        if let Some(local) = self.local_replica_mut() {
            local.message_stage = ReplicaMessageStage::RAProxyReplyPending;
            if local.state == ReplicaState::StandBy {
                local.state = ReplicaState::InBuild;
                reset_fm = true;
            }
        }
        if reset_fm {
            self.fm_message_state.reset();
        }
    }

    /// Whether an `UpdateConfiguration` reply belongs to the running phase
    pub fn can_process_update_configuration_reply(
        &self,
        body: &UpdateConfigurationReplyBody,
    ) -> bool {
        if !self.is_local_replica_open() || self.is_close_pending() {
            return false;
        }
        if body.cc_epoch != self.cc_epoch {
            return false;
        }
        let expected = match body.kind {
            UpdateConfigurationKind::DemoteCatchup => ReconfigurationStage::Phase0Demote,
            UpdateConfigurationKind::Catchup => ReconfigurationStage::Phase2Catchup,
            UpdateConfigurationKind::EndReconfiguration => ReconfigurationStage::Phase4Activate,
            UpdateConfigurationKind::UpdateRoles => return true,
        };
        self.reconfiguration_stage() == expected
            && self
                .local_replica()
                .is_some_and(|r| r.message_stage == ReplicaMessageStage::RAProxyReplyPending)
    }

    /// Apply the replicator's answer to an `UpdateConfiguration`
    pub fn process_update_configuration_reply(
        &mut self,
        body: &UpdateConfigurationReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        match body.kind {
            UpdateConfigurationKind::DemoteCatchup | UpdateConfigurationKind::Catchup => {
                let local_desc = body.replicas.iter().find(|r| r.node.id == self.owner);
                self.catchup_completed(body.code, local_desc, ctx);
            }
            UpdateConfigurationKind::EndReconfiguration => {
                if !body.code.is_success() {
                    return;
                }
                self.on_replicator_configuration_updated();
                if let Some(local) = self.local_replica_mut() {
                    local.message_stage = ReplicaMessageStage::None;
                }
                self.check_phase4_progress(ctx);
            }
            UpdateConfigurationKind::UpdateRoles => {
                if body.code.is_success() {
                    self.on_replicator_configuration_updated();
                }
            }
        }
    }

    fn on_replicator_configuration_updated(&mut self) {
        self.replicator_configuration_update_pending = false;
        let owner = self.owner;
        for replica in self.replicas.remote_mut(owner) {
            replica.replicator_remove_pending = false;
        }
    }

    fn catchup_completed(
        &mut self,
        code: ReplyCode,
        local_desc: Option<&ReplicaDescription>,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let state_changed = match code {
            ReplyCode::Success => false,
            ReplyCode::StateChangedOnDataLoss => true,
            ReplyCode::Failed => {
                self.on_change_role_failure(ctx);
                return;
            }
            _ => return,
        };

        ctx.enable_update();
        self.retryable_error.on_success();
        self.on_replicator_configuration_updated();

        let primary_changed = self.has_primary_changed();
        if let Some(local) = self.local_replica_mut() {
            local.message_stage = ReplicaMessageStage::None;
            if primary_changed {
                local.state = ReplicaState::Ready;
            }
        }

        if self.reconfiguration_stage() == ReconfigurationStage::Phase0Demote {
            self.finish_swap_primary(ctx);
            return;
        }

        if primary_changed {
            if let Some(desc) = local_desc.filter(|d| d.last_lsn != INVALID_LSN) {
                self.deactivation_info = DeactivationInfo::new(self.cc_epoch, desc.last_lsn);
            }
        }

        if state_changed {
            let owner = self.owner;
            for replica in self.replicas.configuration_remote_mut(owner) {
                if replica.is_ready_and_up() {
                    replica.to_be_restarted = true;
                }
            }
        }

        self.start_phase3_deactivate(ctx);
    }

    fn on_change_role_failure(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let action = self.retryable_error.on_failure(
            ctx.config.replica_change_role_failure_warning_report_threshold,
            ctx.config.replica_change_role_failure_restart_threshold,
        );
        let failures = self.retryable_error.failure_count();
        match action {
            RetryableErrorAction::Retry => {}
            RetryableErrorAction::RetryWithWarning => {
                tracing::warn!(ft = %self.id, failures, "change role failed during catch-up");
            }
            RetryableErrorAction::ThresholdReached => {
                let mode = self.restart_or_drop_mode();
                tracing::warn!(ft = %self.id, failures, mode = ?mode, "change role failure threshold reached");
                self.start_close_local_replica(mode, ctx);
            }
        }
    }

    fn finish_swap_primary(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let elapsed = self.reconfiguration.phase_elapsed(ctx.now);
        let phase0_duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(ft = %self.id, epoch = %self.cc_epoch, phase0_duration_ms, "demote complete");

        self.reconfiguration
            .finish(ReconfigurationResult::DemoteCompleted);
        self.message_retry_active = false;
        self.send_continue_swap_primary(phase0_duration_ms, ctx);
    }

    fn send_continue_swap_primary(&self, phase0_duration_ms: u64, ctx: &mut FailoverUnitContext<'_>) {
        let Some(primary) = self.replicas.cc_primary().map(|r| r.node) else {
            return;
        };
        ctx.send_to_node(
            primary,
            Message::DoReconfiguration(DoReconfigurationBody {
                config: self.configuration_body(),
                phase0_duration_ms: Some(phase0_duration_ms),
                is_persisted: self.is_persisted,
            }),
        );
    }

    /// Whether a `CancelCatchupReplicaSet` reply ends the running abort
    pub fn can_process_cancel_catchup_reply(&self, body: &ReplicaReplyBody) -> bool {
        self.is_local_replica_open()
            && body.cc_epoch == self.cc_epoch
            && self.reconfiguration_stage() == ReconfigurationStage::AbortPhase0Demote
    }

    /// Finish aborting a demote
    pub fn process_cancel_catchup_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let result = match body.code {
            ReplyCode::Success => ReconfigurationResult::AbortSwapPrimary,
            ReplyCode::DemoteCompleted => ReconfigurationResult::DemoteCompleted,
            _ => return,
        };

        ctx.enable_update();
        self.replicator_configuration_update_pending = false;
        self.retryable_error.on_success();
        if let Some(local) = self.local_replica_mut() {
            local.message_stage = ReplicaMessageStage::None;
        }
        self.reconfiguration.finish(result);
        self.message_retry_active = false;
        if result == ReconfigurationResult::AbortSwapPrimary {
            self.revert_configuration();
        }
        tracing::info!(ft = %self.id, epoch = %self.cc_epoch, result = ?result, "demote abort finished");
    }

    // ========================================================================
    // Phase3: Deactivate
    // ========================================================================

    fn should_skip_phase3(&self, config: &FailoverConfig) -> bool {
        config.enable_phase3_phase4_in_parallel
            && self
                .replicas
                .configuration(self.owner)
                .all(|r| r.is_in_previous_configuration() && r.is_in_current_configuration())
    }

    fn start_phase3_deactivate(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        if self.should_skip_phase3(ctx.config) {
            self.start_phase4_activate(ctx);
            return;
        }

        self.reconfiguration
            .start_phase(ReconfigurationStage::Phase3Deactivate, ctx.now);
        tracing::info!(ft = %self.id, epoch = %self.cc_epoch, "deactivating previous configuration");
        self.ic_epoch = self.cc_epoch;

        let owner = self.owner;
        if let Some(local) = self.local_replica_mut() {
            local.ic_role = local.cc_role;
        }
        for replica in self.replicas.configuration_remote_mut(owner) {
            replica.ic_role = replica.cc_role;
            if replica.is_dropped() {
                continue;
            }
            let sendable = replica.to_be_restarted || is_deactivate_eligible(replica);
            if (replica.is_in_previous_configuration() || replica.to_be_restarted) && sendable {
                replica.message_stage = ReplicaMessageStage::RAReplyPending;
            }
        }

        ctx.enable_update();
        self.resend_reconfiguration_messages(ctx);
        self.check_phase3_progress(ctx);
    }

    /// Deactivated-replica counts of the previous configuration
    pub fn phase3_read_quorum(&self) -> ReadQuorum {
        let mut quorum = ReadQuorum::default();
        for replica in self
            .replicas
            .configuration(self.owner)
            .filter(|r| r.is_in_previous_configuration())
        {
            quorum.count += 1;
            if replica.is_dropped() {
                continue;
            }
            if replica.message_stage == ReplicaMessageStage::None {
                quorum.completed += 1;
            } else if replica.is_up {
                quorum.up_waiting += 1;
            } else {
                quorum.down_waiting += 1;
            }
        }
        quorum
    }

    fn check_phase3_progress(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        if self.pc_epoch.is_valid() && self.phase3_read_quorum().is_below_quorum() {
            return;
        }
        let owner = self.owner;
        let up_pending = self
            .replicas
            .configuration_remote(owner)
            .any(|r| r.is_up && r.message_stage == ReplicaMessageStage::RAReplyPending);
        if up_pending {
            return;
        }
        self.start_phase4_activate(ctx);
    }

    /// Whether a `DeactivateReply` belongs to the running Phase3
    pub fn can_process_deactivate_reply(&self, body: &ReplicaReplyBody) -> bool {
        self.is_local_replica_open()
            && self.reconfiguration_stage() == ReconfigurationStage::Phase3Deactivate
            && body.cc_epoch == self.cc_epoch
            && self.is_reply_pending_from(&body.replica)
    }

    /// Record a remote deactivation
    pub fn process_deactivate_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        if !body.code.is_success() {
            return;
        }
        if let Some(replica) = self.replicas.get_mut(body.replica.node.id) {
            replica.message_stage = ReplicaMessageStage::None;
            if replica.to_be_restarted {
                replica.to_be_restarted = false;
                replica.mark_down();
            }
        }
        self.check_phase3_progress(ctx);
    }

    // ========================================================================
    // Phase4: Activate
    // ========================================================================

    fn start_phase4_activate(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        self.reconfiguration
            .start_phase(ReconfigurationStage::Phase4Activate, ctx.now);
        tracing::info!(ft = %self.id, epoch = %self.cc_epoch, "activating current configuration");

        let owner = self.owner;
        for replica in self.replicas.configuration_remote_mut(owner) {
            if !replica.is_in_current_configuration() || replica.is_dropped() {
                continue;
            }
            replica.message_stage = ReplicaMessageStage::RAReplyPending;
            if replica.state == ReplicaState::InBuild && replica.to_be_deactivated {
                replica.to_be_activated = true;
            }
        }
        if let Some(local) = self.local_replica_mut() {
            local.message_stage = ReplicaMessageStage::RAProxyReplyPending;
        }

        ctx.enable_update();
        self.resend_reconfiguration_messages(ctx);
        self.check_phase4_progress(ctx);
    }

    fn is_up_ready_activation_pending(&self) -> bool {
        self.replicas.configuration_remote(self.owner).any(|r| {
            r.is_ready_and_up() && r.message_stage == ReplicaMessageStage::RAReplyPending
        })
    }

    fn is_local_proxy_reply_pending(&self) -> bool {
        self.local_replica()
            .is_some_and(|r| r.message_stage == ReplicaMessageStage::RAProxyReplyPending)
    }

    fn check_phase4_progress(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let owner = self.owner;
        if self.is_up_ready_activation_pending() {
            return;
        }
        let in_build_pending = self.replicas.configuration_remote(owner).any(|r| {
            r.is_up
                && r.state == ReplicaState::InBuild
                && r.to_be_activated
                && r.message_stage == ReplicaMessageStage::RAReplyPending
        });
        if in_build_pending {
            return;
        }
        if self
            .replicas
            .configuration_remote(owner)
            .any(|r| r.is_up && r.to_be_restarted)
        {
            return;
        }
        if self.is_local_proxy_reply_pending() {
            return;
        }
        if self.replicator_configuration_update_pending {
            if let Some(local) = self.local_replica_mut() {
                local.message_stage = ReplicaMessageStage::RAProxyReplyPending;
            }
            self.send_update_configuration(UpdateConfigurationKind::EndReconfiguration, ctx);
            return;
        }
        if self
            .replicas
            .remote(owner)
            .any(|r| r.replicator_remove_pending)
        {
            return;
        }

        self.complete_reconfiguration(ctx);
    }

    /// Whether an `ActivateReply` belongs to the running Phase4
    pub fn can_process_activate_reply(&self, body: &ReplicaReplyBody) -> bool {
        self.is_local_replica_open()
            && self.reconfiguration_stage() == ReconfigurationStage::Phase4Activate
            && body.cc_epoch == self.cc_epoch
            && self.is_reply_pending_from(&body.replica)
    }

    /// Record a remote activation
    pub fn process_activate_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        if !body.code.is_success() {
            return;
        }
        let was_blocked = self.is_up_ready_activation_pending();
        if let Some(replica) = self.replicas.get_mut(body.replica.node.id) {
            replica.message_stage = ReplicaMessageStage::None;
            if replica.to_be_activated {
                replica.state = ReplicaState::Ready;
                replica.to_be_activated = false;
                replica.to_be_deactivated = false;
            }
        }
        if was_blocked && !self.is_up_ready_activation_pending() && self.is_local_proxy_reply_pending()
        {
            self.send_update_configuration(UpdateConfigurationKind::EndReconfiguration, ctx);
        }
        self.check_phase4_progress(ctx);
    }

    fn complete_reconfiguration(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let owner = self.owner;
        self.reset_reconfiguration_states();
        self.replicas.retain(|r| {
            r.node.id == owner
                || r.is_in_current_configuration()
                || (r.cc_role == ReplicaRole::Idle
                    && (r.is_ready_and_up() || r.message_stage != ReplicaMessageStage::None))
        });

        self.reconfiguration.finish(ReconfigurationResult::Completed);
        self.endpoint_publish.clear();
        self.message_retry_active = false;
        ctx.enable_update();

        tracing::info!(ft = %self.id, epoch = %self.cc_epoch, "reconfiguration completed");
        ctx.send_to_fm(Message::DoReconfigurationReply(self.configuration_body()));
    }

    fn is_reply_pending_from(&self, desc: &ReplicaDescription) -> bool {
        self.replicas.get(desc.node.id).is_some_and(|r| {
            r.message_stage == ReplicaMessageStage::RAReplyPending
                && r.instance_id == desc.instance_id
        })
    }

    // ========================================================================
    // Resend
    // ========================================================================

    /// Resend everything the unit is waiting on
    pub fn resend_reconfiguration_messages(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        self.last_message_resend = Some(ctx.now);

        if let Some(mode) = self.open_mode {
            self.send_replica_open(mode, ctx);
        }
        if let Some(mode) = self.close_mode {
            self.send_replica_close(mode, ctx);
            return;
        }
        if !self.is_local_replica_open() {
            return;
        }

        let local_pending = self.is_local_proxy_reply_pending();
        match self.reconfiguration_stage() {
            ReconfigurationStage::Phase0Demote if local_pending => {
                self.send_update_configuration(UpdateConfigurationKind::DemoteCatchup, ctx);
            }
            ReconfigurationStage::AbortPhase0Demote => self.send_cancel_catchup(ctx),
            ReconfigurationStage::Phase1GetLsn => {
                let config = self.configuration_body();
                for replica in self.pending_up_remote_replicas() {
                    ctx.send_to_node(replica.node, Message::GetLsn(config.clone()));
                }
                if local_pending {
                    if let Some(body) = self.local_replica_body() {
                        ctx.send_to_rap(Message::ReplicatorGetStatus(body));
                    }
                }
            }
            ReconfigurationStage::Phase2Catchup if local_pending => {
                self.send_update_configuration(UpdateConfigurationKind::Catchup, ctx);
            }
            ReconfigurationStage::Phase3Deactivate => {
                let config = self.configuration_body();
                for replica in self.pending_up_remote_replicas() {
                    if replica.to_be_restarted || is_deactivate_eligible(replica) {
                        ctx.send_to_node(
                            replica.node,
                            Message::Deactivate(DeactivateBody {
                                config: config.clone(),
                                deactivation_info: self.deactivation_info,
                                is_force: replica.to_be_restarted,
                            }),
                        );
                    }
                }
            }
            ReconfigurationStage::Phase4Activate => {
                let config = self.configuration_body();
                for replica in self.pending_up_remote_replicas() {
                    let activatable = replica.state == ReplicaState::Ready
                        || (replica.state == ReplicaState::InBuild && replica.to_be_activated);
                    if activatable {
                        ctx.send_to_node(replica.node, Message::Activate(config.clone()));
                    }
                }
                if local_pending && !self.is_up_ready_activation_pending() {
                    self.send_update_configuration(UpdateConfigurationKind::EndReconfiguration, ctx);
                }
            }
            ReconfigurationStage::None => {
                if self.replicator_configuration_update_pending && self.is_local_primary() {
                    self.send_update_configuration(UpdateConfigurationKind::UpdateRoles, ctx);
                }
                self.resend_build_messages(ctx);
            }
            _ => {}
        }
    }

    fn pending_up_remote_replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.configuration_remote(self.owner).filter(|r| {
            r.is_up && r.message_stage == ReplicaMessageStage::RAReplyPending
        })
    }

    pub(crate) fn send_update_configuration(
        &self,
        kind: UpdateConfigurationKind,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        ctx.send_to_rap(Message::UpdateConfiguration(UpdateConfigurationBody {
            kind,
            config: self.configuration_body(),
        }));
    }

    pub(crate) fn restart_or_drop_mode(&self) -> CloseMode {
        if self.is_persisted {
            CloseMode::Restart
        } else {
            CloseMode::Drop
        }
    }
}

/// Whether a remote replica can take a non-forced `Deactivate`
fn is_deactivate_eligible(replica: &Replica) -> bool {
    replica.state != ReplicaState::InCreate
        && !(replica.state == ReplicaState::InBuild && !replica.to_be_deactivated)
}

/// Whether a remote replica has to be rebuilt after GetLSN
///
/// Only up, ready replicas in the current configuration are considered. They restart when
/// they did not report, reported an unknown range, or lag behind the start of the new
/// primary's log.
fn is_restart_needed_after_get_lsn(local: &ReplicaLsn, remote: &Replica) -> bool {
    if !remote.is_up || !remote.is_in_current_configuration() {
        return false;
    }
    if remote.state != ReplicaState::Ready {
        return false;
    }
    match remote.lsn {
        ReplicaLsn::NotSet | ReplicaLsn::Unknown => true,
        ReplicaLsn::Known { last, .. } => {
            local.last() > last && (local.first() == 0 || last < local.first() - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Endpoint;
    use crate::test_support::*;
    use ra_core::{Epoch, ReplicaRole, Timestamp};

    fn failover_to_local(config: &FailoverConfig) -> (FailoverUnit, FailoverUnitContext<'_>) {
        let mut ctx = context(config);
        let mut ft = open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Secondary, true),
                (2, ReplicaRole::Primary, true),
                (3, ReplicaRole::Secondary, true),
            ],
        );
        let body = do_reconfiguration(
            epoch(4, 1, 1),
            epoch(4, 2, 0),
            &[
                (1, ReplicaRole::Secondary, ReplicaRole::Primary, true),
                (2, ReplicaRole::Primary, ReplicaRole::Secondary, false),
                (3, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
            ],
        );
        ft.do_reconfiguration(&body, &mut ctx);
        (ft, ctx)
    }

    fn get_lsn_reply(ft: &FailoverUnit, node_id: u64, first: i64, last: i64) -> GetLsnReplyBody {
        GetLsnReplyBody {
            reply: ReplicaReplyBody {
                ft_id: ft.id(),
                cc_epoch: ft.cc_epoch(),
                replica: ReplicaDescription::new(node(node_id), node_id as i64, 1)
                    .with_lsn(first, last),
                code: ReplyCode::Success,
            },
            deactivation_info: DeactivationInfo::Invalid,
        }
    }

    fn local_status(ft: &FailoverUnit, first: i64, last: i64) -> ReplicaReplyBody {
        ReplicaReplyBody {
            ft_id: ft.id(),
            cc_epoch: ft.cc_epoch(),
            replica: ReplicaDescription::new(node(1), 1, 1).with_lsn(first, last),
            code: ReplyCode::Success,
        }
    }

    /// Local primary keeps its role, node 3 leaves the configuration; starts in Phase2
    fn catchup_with_node3_leaving(config: &FailoverConfig) -> FailoverUnit {
        let mut ctx = context(config);
        let mut ft = open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, true),
                (3, ReplicaRole::Secondary, true),
            ],
        );
        let body = do_reconfiguration(
            epoch(4, 1, 1),
            epoch(4, 1, 2),
            &[
                (1, ReplicaRole::Primary, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
                (3, ReplicaRole::Secondary, ReplicaRole::None, true),
            ],
        );
        ft.do_reconfiguration(&body, &mut ctx);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase2Catchup);
        ft
    }

    fn uc_reply(
        kind: UpdateConfigurationKind,
        cc_epoch: Epoch,
        code: ReplyCode,
    ) -> UpdateConfigurationReplyBody {
        UpdateConfigurationReplyBody {
            kind,
            ft_id: ft_id(),
            cc_epoch,
            replicas: Vec::new(),
            code,
        }
    }

    fn reply_from(ft: &FailoverUnit, node_id: u64) -> ReplicaReplyBody {
        ReplicaReplyBody {
            ft_id: ft.id(),
            cc_epoch: ft.cc_epoch(),
            replica: ReplicaDescription::new(node(node_id), node_id as i64, 1),
            code: ReplyCode::Success,
        }
    }

    fn sent_to<'c>(ctx: &'c FailoverUnitContext<'_>, n: u64) -> Vec<&'c Message> {
        ctx.sent()
            .iter()
            .filter(|e| e.target == Endpoint::Node(node(n)))
            .map(|e| &e.message)
            .collect()
    }

    #[test]
    fn test_read_quorum() {
        let quorum = ReadQuorum {
            count: 3,
            completed: 1,
            up_waiting: 1,
            down_waiting: 1,
        };
        assert!(quorum.is_below_quorum());
        assert_eq!(quorum.waiting(), 2);
        assert!(!ReadQuorum {
            count: 3,
            completed: 2,
            ..ReadQuorum::default()
        }
        .is_below_quorum());
        assert!(!ReadQuorum::default().is_below_quorum());
    }

    #[test]
    fn test_local_wins_election_and_starts_catchup() {
        let config = FailoverConfig::default();
        let (mut ft, _) = failover_to_local(&config);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);

        let mut ctx = context(&config);
        let reply = get_lsn_reply(&ft, 3, 1, 8);
        assert!(ft.can_process_get_lsn_reply(&reply));
        ft.process_get_lsn_reply(&reply, &mut ctx);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);

        let status = local_status(&ft, 1, 10);
        ft.process_local_status_reply(&status, &mut ctx);

        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase2Catchup);
        assert!(ctx.is_update_requested());
        assert!(ctx.sent().iter().any(|e| matches!(
            &e.message,
            Message::UpdateConfiguration(uc) if uc.kind == UpdateConfigurationKind::Catchup
        )));
        assert_eq!(ft.deactivation_info(), DeactivationInfo::Invalid);
    }

    #[test]
    fn test_remote_winner_sends_change_configuration() {
        let config = FailoverConfig::default();
        let (mut ft, _) = failover_to_local(&config);
        let mut ctx = context(&config);
        ft.process_get_lsn_reply(&get_lsn_reply(&ft, 3, 1, 20), &mut ctx);
        ft.process_local_status_reply(&local_status(&ft, 1, 10), &mut ctx);

        assert!(!ft.is_reconfiguring());
        assert_eq!(
            ft.reconfiguration().result(),
            ReconfigurationResult::ChangeConfiguration
        );
        assert_eq!(ft.cc_epoch(), epoch(4, 1, 1));
        let sent = ctx.sent();
        assert!(sent
            .iter()
            .any(|e| e.target == Endpoint::Fm && matches!(e.message, Message::ChangeConfiguration(_))));
    }

    #[test]
    fn test_phase1_waits_for_up_replica_until_timeout() {
        let config = FailoverConfig::default();
        let (mut ft, _) = failover_to_local(&config);
        let mut ctx = context(&config);
        ft.process_local_status_reply(&local_status(&ft, 1, 10), &mut ctx);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);

        // After the wait, node 3 stays unanswered; local plus down node 2 are not a quorum
        // of the current configuration, and node 2 may still come back.
        let mut later = context(&config);
        later.now = Timestamp(1_000 + config.remote_replica_progress_query_wait_duration_ms);
        ft.check_reconfiguration_progress(&mut later);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
    }

    #[test]
    fn test_data_loss_reported_once() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Secondary, true),
                (2, ReplicaRole::Primary, true),
                (3, ReplicaRole::Secondary, true),
            ],
        );
        let body = do_reconfiguration(
            epoch(4, 1, 1),
            epoch(4, 2, 0),
            &[
                (1, ReplicaRole::Secondary, ReplicaRole::Primary, true),
                (2, ReplicaRole::Primary, ReplicaRole::Secondary, false),
                (3, ReplicaRole::Secondary, ReplicaRole::Secondary, false),
            ],
        );
        ft.do_reconfiguration(&body, &mut ctx);
        for replica in ft.replicas.remote_mut(NodeId(1)) {
            replica.mark_dropped();
        }

        let mut ctx = context(&config);
        ft.process_local_status_reply(&local_status(&ft, 1, 10), &mut ctx);
        ft.check_reconfiguration_progress(&mut ctx);
        let reports = ctx
            .sent()
            .iter()
            .filter(|e| matches!(e.message, Message::DataLossReport(_)))
            .count();
        assert_eq!(reports, 1);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
    }

    #[test]
    fn test_restart_needed_after_get_lsn() {
        let local = ReplicaLsn::Known { first: 50, last: 100 };
        let mut remote = Replica::from_description(
            &ReplicaDescription::new(node(2), 2, 1)
                .with_roles(ReplicaRole::Secondary, ReplicaRole::Secondary),
        );
        assert!(is_restart_needed_after_get_lsn(&local, &remote));
        remote.lsn = ReplicaLsn::Known { first: 1, last: 49 };
        assert!(is_restart_needed_after_get_lsn(&local, &remote));
        remote.lsn = ReplicaLsn::Known { first: 1, last: 80 };
        assert!(!is_restart_needed_after_get_lsn(&local, &remote));
        remote.is_up = false;
        assert!(!is_restart_needed_after_get_lsn(&local, &remote));
    }

    #[test]
    fn test_election_prefers_newest_deactivation_epoch() {
        let config = FailoverConfig::default();
        let (mut ft, _) = failover_to_local(&config);
        ft.deactivation_info = DeactivationInfo::new(epoch(4, 1, 1), 10);
        if let Some(local) = ft.replicas.get_mut(NodeId(1)) {
            local.lsn = ReplicaLsn::Known { first: 1, last: 10 };
        }
        if let Some(remote) = ft.replicas.get_mut(NodeId(3)) {
            remote.lsn = ReplicaLsn::Known { first: 1, last: 30 };
            remote.deactivation_info = DeactivationInfo::new(Epoch::from_parts(4, 0, 5), 30);
        }
        assert_eq!(ft.find_primary(&config), Some(NodeId(1)));

        let disabled = FailoverConfig {
            is_deactivation_info_enabled: false,
            ..FailoverConfig::default()
        };
        assert_eq!(ft.find_primary(&disabled), Some(NodeId(3)));
    }

    #[test]
    fn test_catchup_reply_starts_deactivate() {
        let config = FailoverConfig::default();
        let mut ft = catchup_with_node3_leaving(&config);

        let mut ctx = context(&config);
        let reply = uc_reply(UpdateConfigurationKind::Catchup, ft.cc_epoch(), ReplyCode::Success);
        assert!(ft.can_process_update_configuration_reply(&reply));
        ft.process_update_configuration_reply(&reply, &mut ctx);

        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase3Deactivate);
        assert_eq!(ft.ic_epoch(), epoch(4, 1, 2));
        assert!(ctx.is_update_requested());
        for n in [2, 3] {
            assert!(
                matches!(sent_to(&ctx, n)[..], [Message::Deactivate(_)]),
                "node {n} not deactivated"
            );
        }
        // Replayed catch-up replies no longer match the running phase
        assert!(!ft.can_process_update_configuration_reply(&reply));
    }

    #[test]
    fn test_stale_catchup_reply_is_ignored() {
        let config = FailoverConfig::default();
        let ft = catchup_with_node3_leaving(&config);

        let older = uc_reply(UpdateConfigurationKind::Catchup, epoch(4, 1, 1), ReplyCode::Success);
        assert!(!ft.can_process_update_configuration_reply(&older));
        let newer = uc_reply(UpdateConfigurationKind::Catchup, epoch(4, 1, 3), ReplyCode::Success);
        assert!(!ft.can_process_update_configuration_reply(&newer));
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase2Catchup);
    }

    #[test]
    fn test_deactivate_replies_start_activate() {
        let config = FailoverConfig::default();
        let mut ft = catchup_with_node3_leaving(&config);
        let mut ctx = context(&config);
        ft.process_update_configuration_reply(
            &uc_reply(UpdateConfigurationKind::Catchup, ft.cc_epoch(), ReplyCode::Success),
            &mut ctx,
        );

        let mut ctx = context(&config);
        let from2 = reply_from(&ft, 2);
        assert!(ft.can_process_deactivate_reply(&from2));
        ft.process_deactivate_reply(&from2, &mut ctx);
        assert!(!ft.can_process_deactivate_reply(&from2));
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase3Deactivate);

        let from3 = reply_from(&ft, 3);
        assert!(ft.can_process_deactivate_reply(&from3));
        ft.process_deactivate_reply(&from3, &mut ctx);

        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase4Activate);
        assert!(matches!(sent_to(&ctx, 2)[..], [Message::Activate(_)]));
        assert!(sent_to(&ctx, 3).is_empty());
        // The replicator is only told to end once the up secondaries are active
        assert!(!ctx
            .sent()
            .iter()
            .any(|e| matches!(e.message, Message::UpdateConfiguration(_))));
    }

    #[test]
    fn test_activate_replies_complete_reconfiguration() {
        let config = FailoverConfig::default();
        let mut ft = catchup_with_node3_leaving(&config);
        let mut ctx = context(&config);
        ft.process_update_configuration_reply(
            &uc_reply(UpdateConfigurationKind::Catchup, ft.cc_epoch(), ReplyCode::Success),
            &mut ctx,
        );
        ft.process_deactivate_reply(&reply_from(&ft, 2), &mut ctx);
        ft.process_deactivate_reply(&reply_from(&ft, 3), &mut ctx);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase4Activate);

        let mut ctx = context(&config);
        let activated = reply_from(&ft, 2);
        assert!(ft.can_process_activate_reply(&activated));
        ft.process_activate_reply(&activated, &mut ctx);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase4Activate);
        assert!(ctx.sent().iter().any(|e| matches!(
            &e.message,
            Message::UpdateConfiguration(uc) if uc.kind == UpdateConfigurationKind::EndReconfiguration
        )));

        let mut ctx = context(&config);
        let ended = uc_reply(
            UpdateConfigurationKind::EndReconfiguration,
            ft.cc_epoch(),
            ReplyCode::Success,
        );
        assert!(ft.can_process_update_configuration_reply(&ended));
        ft.process_update_configuration_reply(&ended, &mut ctx);

        assert!(!ft.is_reconfiguring());
        assert_eq!(ft.reconfiguration().result(), ReconfigurationResult::Completed);
        assert!(!ft.pc_epoch().is_valid());
        assert_eq!(ft.cc_epoch(), epoch(4, 1, 2));
        assert!(ft.replicas().get(NodeId(3)).is_none());
        assert_eq!(
            ft.replicas().get(NodeId(2)).map(|r| (r.pc_role, r.cc_role)),
            Some((ReplicaRole::None, ReplicaRole::Secondary))
        );

        let replies: Vec<_> = ctx
            .sent()
            .iter()
            .filter_map(|e| match &e.message {
                Message::DoReconfigurationReply(body) => Some((e.target, body)),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 1);
        let (target, body) = replies[0];
        assert_eq!(target, Endpoint::Fm);
        assert_eq!(body.cc_epoch, epoch(4, 1, 2));
        let nodes: Vec<u64> = body.replicas.iter().map(|r| r.node.id.0).collect();
        assert_eq!(nodes.len(), 2);
        assert!(!nodes.contains(&3));
    }

    #[test]
    fn test_cancel_catchup_reply_finishes_abort() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, true),
                (3, ReplicaRole::Secondary, true),
            ],
        );
        let swap = do_reconfiguration(
            epoch(4, 1, 1),
            epoch(4, 2, 0),
            &[
                (1, ReplicaRole::Primary, ReplicaRole::Secondary, true),
                (2, ReplicaRole::Secondary, ReplicaRole::Primary, true),
                (3, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
            ],
        );
        ft.do_reconfiguration(&swap, &mut ctx);
        let failover = do_reconfiguration(
            epoch(4, 1, 1),
            epoch(4, 3, 0),
            &[
                (1, ReplicaRole::Primary, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, ReplicaRole::Secondary, false),
                (3, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
            ],
        );
        ft.do_reconfiguration(&failover, &mut ctx);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::AbortPhase0Demote);

        let mut stale = reply_from(&ft, 1);
        stale.cc_epoch = epoch(4, 3, 0);
        assert!(!ft.can_process_cancel_catchup_reply(&stale));

        let mut ctx = context(&config);
        let cancelled = reply_from(&ft, 1);
        assert!(ft.can_process_cancel_catchup_reply(&cancelled));
        ft.process_cancel_catchup_reply(&cancelled, &mut ctx);

        assert!(!ft.is_reconfiguring());
        assert_eq!(
            ft.reconfiguration().result(),
            ReconfigurationResult::AbortSwapPrimary
        );
        assert_eq!(ft.cc_epoch(), epoch(4, 1, 1));
        assert_eq!(
            ft.local_replica().map(|r| r.cc_role),
            Some(ReplicaRole::Primary)
        );
        assert!(!ft.needs_message_resend());
        assert!(!ft.can_process_cancel_catchup_reply(&cancelled));
    }

    #[test]
    fn test_demote_catchup_reply_continues_swap_on_new_primary() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = open_ft(
            epoch(4, 1, 1),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, true),
                (3, ReplicaRole::Secondary, true),
            ],
        );
        let swap = do_reconfiguration(
            epoch(4, 1, 1),
            epoch(4, 2, 0),
            &[
                (1, ReplicaRole::Primary, ReplicaRole::Secondary, true),
                (2, ReplicaRole::Secondary, ReplicaRole::Primary, true),
                (3, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
            ],
        );
        ft.do_reconfiguration(&swap, &mut ctx);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase0Demote);

        let mut ctx = context(&config);
        let demoted = uc_reply(
            UpdateConfigurationKind::DemoteCatchup,
            ft.cc_epoch(),
            ReplyCode::Success,
        );
        assert!(ft.can_process_update_configuration_reply(&demoted));
        ft.process_update_configuration_reply(&demoted, &mut ctx);

        assert!(!ft.is_reconfiguring());
        assert_eq!(
            ft.reconfiguration().result(),
            ReconfigurationResult::DemoteCompleted
        );
        assert!(matches!(
            sent_to(&ctx, 2)[..],
            [Message::DoReconfiguration(DoReconfigurationBody { phase0_duration_ms: Some(_), .. })]
        ));
    }

    #[test]
    fn test_get_lsn_reply_under_older_epoch_counts_once() {
        let config = FailoverConfig::default();
        let (mut ft, _) = failover_to_local(&config);
        let mut ctx = context(&config);

        let mut reply = get_lsn_reply(&ft, 3, 1, 8);
        reply.reply.cc_epoch = epoch(4, 1, 1);
        assert!(ft.can_process_get_lsn_reply(&reply));
        ft.process_get_lsn_reply(&reply, &mut ctx);
        assert_eq!(
            ft.replicas().get(NodeId(3)).map(|r| r.lsn),
            Some(ReplicaLsn::Known { first: 1, last: 8 })
        );
        assert!(!ft.can_process_get_lsn_reply(&reply));

        ft.process_local_status_reply(&local_status(&ft, 1, 10), &mut ctx);
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase2Catchup);
    }

    #[test]
    fn test_get_lsn_reply_from_dropped_replica_marks_it_dropped() {
        let config = FailoverConfig::default();
        let (mut ft, _) = failover_to_local(&config);
        let mut ctx = context(&config);

        let mut reply = get_lsn_reply(&ft, 3, 1, 8);
        reply.reply.replica = reply.reply.replica.with_state(ReplicaState::Dropped);
        assert!(ft.can_process_get_lsn_reply(&reply));
        ft.process_get_lsn_reply(&reply, &mut ctx);

        let node3 = ft.replicas().get(NodeId(3)).unwrap();
        assert!(node3.is_dropped());
        assert_eq!(node3.message_stage, ReplicaMessageStage::None);
        assert!(ctx.is_update_requested());
        assert!(!ft.can_process_get_lsn_reply(&reply));

        // Local plus a dropped node 3 is short of a read quorum while node 2 may come back
        ft.process_local_status_reply(&local_status(&ft, 1, 10), &mut ctx);
        let current = ft.phase1_read_quorum(false);
        assert_eq!((current.completed, current.up_waiting), (1, 0));
        assert_eq!(ft.reconfiguration_stage(), ReconfigurationStage::Phase1GetLsn);
    }
}
