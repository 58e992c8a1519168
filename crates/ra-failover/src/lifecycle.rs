//! Open and close of the local replica
//!
//! The local replica is opened on `AddPrimary`, `AddInstance` and `CreateReplica`, reopened on
//! node activation, and closed on faults, deletes, forced deactivation, restart thresholds and
//! node deactivation. Every open and close is a request to the local replication proxy that is
//! resent by the retry pass until its reply arrives.

use crate::context::FailoverUnitContext;
use crate::failover_unit::{FailoverUnit, FailoverUnitState, OpenReplyTarget};
use crate::messages::{
    CloseMode, FaultType, Message, OpenMode, ReplicaBody, ReplicaCloseBody, ReplicaOpenBody,
    ReplicaReplyBody, ReplyCode, ReportFaultBody,
};
use crate::reconfiguration::ReconfigurationResult;
use crate::replica::{Replica, ReplicaStore};
use crate::retryable_error::{RetryableErrorAction, RetryableErrorStateName};
use ra_core::{DeactivationInfo, Epoch, ReplicaDescription, ReplicaRole, ReplicaState};

impl FailoverUnit {
    // ========================================================================
    // Open
    // ========================================================================

    /// Whether an open request for `desc` is older than the local replica
    fn is_stale_instance(&self, desc: &ReplicaDescription) -> bool {
        self.local_replica()
            .is_some_and(|local| local.instance_id > desc.instance_id)
    }

    /// Whether the local replica at `desc`'s instance is already open or opening
    fn is_same_open_instance(&self, desc: &ReplicaDescription) -> bool {
        self.is_open()
            && self
                .local_replica()
                .is_some_and(|local| local.instance_id == desc.instance_id)
    }

    /// Create the local replica described by `body` and open it
    ///
    /// Handles `AddPrimary`, `AddInstance` and `CreateReplica`. Requests for an older instance
    /// are ignored. A request for the instance already open is answered once the open completes.
    pub fn open_new_replica(
        &mut self,
        body: &ReplicaBody,
        reply_to: OpenReplyTarget,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        if self.is_stale_instance(&body.replica) {
            tracing::debug!(ft = %self.id, incoming = body.replica.instance_id, "open for an older instance");
            return;
        }
        if self.is_same_open_instance(&body.replica) {
            if self.open_mode.is_none() && !self.is_close_pending() {
                self.send_open_reply(reply_to, ReplyCode::Success, ctx);
            }
            return;
        }
        if self.is_open() {
            tracing::debug!(ft = %self.id, "open requested while another instance is hosted");
            return;
        }

        let role = match reply_to {
            OpenReplyTarget::AddPrimary => ReplicaRole::Primary,
            OpenReplyTarget::AddInstance | OpenReplyTarget::CreateReplica(_) => {
                ReplicaRole::Idle
            }
        };
        self.reset_for_new_replica(body, role);
        self.open_reply_to = Some(reply_to);
        tracing::info!(ft = %self.id, instance = body.replica.instance_id, role = %role, "opening new replica");
        self.start_open(OpenMode::Open, ctx);
    }

    fn reset_for_new_replica(&mut self, body: &ReplicaBody, role: ReplicaRole) {
        let mut local = Replica::from_description(&body.replica);
        local.pc_role = ReplicaRole::None;
        local.cc_role = role;
        local.state = ReplicaState::InBuild;
        local.is_up = true;

        self.replicas = ReplicaStore::new();
        self.replicas.add(local);
        self.pc_epoch = Epoch::invalid();
        self.ic_epoch = Epoch::invalid();
        self.cc_epoch = body.cc_epoch;
        self.deactivation_info = DeactivationInfo::Invalid;
        self.is_persisted = body.is_persisted;
        self.local_replica_deleted = false;
        self.replicator_configuration_update_pending = false;
        self.message_retry_active = false;
        self.sender_node = None;
        self.endpoint.clear();
        self.endpoint_publish.clear();
        self.fm_message_state.reset();
    }

    /// Reopen a down persisted replica
    ///
    /// Used on node activation. Dropped, deleted and volatile replicas are not reopened.
    pub fn reopen_down_replica(&mut self, ctx: &mut FailoverUnitContext<'_>) -> bool {
        if !self.is_closed() || !self.is_persisted || self.local_replica_deleted {
            return false;
        }
        if !self.local_replica().is_some_and(|r| !r.is_dropped()) {
            return false;
        }
        self.open_reply_to = None;
        tracing::info!(ft = %self.id, "reopening down replica");
        self.start_open(OpenMode::Reopen, ctx);
        true
    }

    fn start_open(&mut self, mode: OpenMode, ctx: &mut FailoverUnitContext<'_>) {
        self.state = FailoverUnitState::Open;
        self.open_mode = Some(mode);
        self.close_mode = None;
        self.retryable_error.enter(RetryableErrorStateName::ReplicaOpen);
        self.touch(ctx.now);
        ctx.enable_update();
        self.send_replica_open(mode, ctx);
    }

    pub(crate) fn send_replica_open(&self, mode: OpenMode, ctx: &mut FailoverUnitContext<'_>) {
        if let Some(replica) = self.local_replica_body() {
            ctx.send_to_rap(Message::ReplicaOpen(ReplicaOpenBody { replica, mode }));
        }
    }

    /// Whether a `ReplicaOpenReply` answers the outstanding open
    pub fn can_process_open_reply(&self, body: &ReplicaReplyBody) -> bool {
        self.open_mode.is_some()
            && self
                .local_replica()
                .is_some_and(|r| r.instance_id == body.replica.instance_id)
    }

    /// Finish or retry the outstanding open
    pub fn process_open_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let Some(mode) = self.open_mode else {
            return;
        };
        match body.code {
            ReplyCode::Success => self.finish_open(mode, ctx),
            ReplyCode::NotFound => {
                tracing::warn!(ft = %self.id, mode = ?mode, "replica state not found on open");
                self.abandon_open(ctx);
            }
            _ => {
                let action = self.retryable_error.on_failure(
                    ctx.config.replica_open_failure_warning_report_threshold,
                    ctx.config.replica_open_failure_max_retry_threshold,
                );
                let failures = self.retryable_error.failure_count();
                match action {
                    RetryableErrorAction::Retry => {}
                    RetryableErrorAction::RetryWithWarning => {
                        tracing::warn!(ft = %self.id, failures, "replica open failed");
                    }
                    RetryableErrorAction::ThresholdReached => {
                        tracing::warn!(ft = %self.id, failures, "replica open failure threshold reached; dropping");
                        self.abandon_open(ctx);
                    }
                }
            }
        }
    }

    fn finish_open(&mut self, mode: OpenMode, ctx: &mut FailoverUnitContext<'_>) {
        self.open_mode = None;
        self.retryable_error.on_success();
        let reply_to = self.open_reply_to.take();

        let ready_on_open = matches!(
            reply_to,
            Some(OpenReplyTarget::AddPrimary) | Some(OpenReplyTarget::AddInstance)
        );
        if let Some(local) = self.local_replica_mut() {
            local.is_up = true;
            if ready_on_open {
                local.state = ReplicaState::Ready;
            }
        }
        if mode == OpenMode::Reopen {
            self.fm_message_state.on_replica_up();
        }
        self.touch(ctx.now);
        ctx.enable_update();
        tracing::info!(ft = %self.id, mode = ?mode, "replica open");

        if let Some(target) = reply_to {
            self.send_open_reply(target, ReplyCode::Success, ctx);
        }
    }

    fn abandon_open(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        self.open_mode = None;
        self.retryable_error.on_success();
        let reply_to = self.open_reply_to.take();
        self.state = FailoverUnitState::Closed;
        if let Some(local) = self.local_replica_mut() {
            local.mark_dropped();
        }
        self.fm_message_state.on_dropped();
        self.touch(ctx.now);
        ctx.enable_update();
        if let Some(target) = reply_to {
            self.send_open_reply(target, ReplyCode::Failed, ctx);
        }
    }

    fn send_open_reply(
        &self,
        target: OpenReplyTarget,
        code: ReplyCode,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let Some(reply) = self.local_reply(code) else {
            return;
        };
        match target {
            OpenReplyTarget::AddPrimary => ctx.send_to_fm(Message::AddPrimaryReply(reply)),
            OpenReplyTarget::AddInstance => ctx.send_to_fm(Message::AddInstanceReply(reply)),
            OpenReplyTarget::CreateReplica(primary) => {
                ctx.send_to_node(primary, Message::CreateReplicaReply(reply))
            }
        }
    }

    pub(crate) fn local_reply(&self, code: ReplyCode) -> Option<ReplicaReplyBody> {
        self.local_description().map(|replica| ReplicaReplyBody {
            ft_id: self.id,
            cc_epoch: self.cc_epoch,
            replica,
            code,
        })
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close the local replica with `mode`
    ///
    /// A pending close is only replaced by one that discards more state.
    pub fn start_close_local_replica(&mut self, mode: CloseMode, ctx: &mut FailoverUnitContext<'_>) {
        if self.is_closed() {
            return;
        }
        if let Some(current) = self.close_mode {
            if current.implies_drop() || !mode.implies_drop() {
                return;
            }
        }

        tracing::info!(ft = %self.id, mode = ?mode, "closing local replica");
        self.open_mode = None;
        self.close_mode = Some(mode);
        self.touch(ctx.now);
        ctx.enable_update();
        self.send_replica_close(mode, ctx);
    }

    pub(crate) fn send_replica_close(&self, mode: CloseMode, ctx: &mut FailoverUnitContext<'_>) {
        if let Some(replica) = self.local_replica_body() {
            ctx.send_to_rap(Message::ReplicaClose(ReplicaCloseBody { replica, mode }));
        }
    }

    /// Whether a `ReplicaCloseReply` answers the outstanding close
    pub fn can_process_close_reply(&self, body: &ReplicaReplyBody) -> bool {
        self.close_mode.is_some()
            && body.code.is_success()
            && self
                .local_replica()
                .is_some_and(|r| r.instance_id == body.replica.instance_id)
    }

    /// Finish the outstanding close
    pub fn process_close_reply(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let Some(mode) = self.close_mode.take() else {
            return;
        };
        self.finish_close(mode, ctx);
    }

    /// The hosting layer terminated the replica without a close reply
    pub fn on_replica_terminated(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        if self.is_closed() {
            return;
        }
        let mode = self.close_mode.take().unwrap_or(CloseMode::Close);
        self.finish_close(mode, ctx);
    }

    fn finish_close(&mut self, mode: CloseMode, ctx: &mut FailoverUnitContext<'_>) {
        self.state = FailoverUnitState::Closed;
        self.open_mode = None;
        self.open_reply_to = None;
        self.message_retry_active = false;
        self.endpoint_publish.clear();
        if self.is_reconfiguring() {
            self.reconfiguration.finish(ReconfigurationResult::None);
            self.reset_reconfiguration_states();
        }

        let drops_state = mode.implies_drop() || (mode == CloseMode::DeactivateNode && !self.is_persisted);
        if drops_state {
            if let Some(local) = self.local_replica_mut() {
                local.mark_dropped();
            }
            self.deactivation_info = DeactivationInfo::Dropped;
        } else if let Some(local) = self.local_replica_mut() {
            local.mark_down();
        }

        match mode {
            CloseMode::Delete => {
                self.local_replica_deleted = true;
                self.fm_message_state.reset();
                if let Some(reply) = self.local_reply(ReplyCode::Success) {
                    ctx.send_to_fm(Message::DeleteReplicaReply(reply));
                }
            }
            CloseMode::Deactivate => {
                self.fm_message_state.on_dropped();
                if let Some(sender) = self.sender_node.take() {
                    if let Some(reply) = self.local_reply(ReplyCode::Success) {
                        ctx.send_to_node(sender, Message::DeactivateReply(reply));
                    }
                }
            }
            _ if drops_state => self.fm_message_state.on_dropped(),
            _ => self.fm_message_state.on_replica_down(),
        }

        self.touch(ctx.now);
        ctx.enable_update();
        tracing::info!(ft = %self.id, mode = ?mode, "local replica closed");

        if mode == CloseMode::Restart && self.is_persisted {
            self.start_open(OpenMode::Reopen, ctx);
        }
    }

    // ========================================================================
    // Notifications from the hosted replica
    // ========================================================================

    /// Apply a fault reported by the hosted replica
    pub fn report_fault(&mut self, body: &ReportFaultBody, ctx: &mut FailoverUnitContext<'_>) {
        if !self.is_open()
            || !self
                .local_replica()
                .is_some_and(|r| r.instance_id == body.replica.replica.instance_id)
        {
            return;
        }
        let mode = match body.fault {
            FaultType::Transient => self.restart_or_drop_mode(),
            FaultType::Permanent => CloseMode::Drop,
        };
        tracing::warn!(ft = %self.id, fault = ?body.fault, "replica reported fault");
        self.start_close_local_replica(mode, ctx);
    }

    /// The hosted replica gave up read/write status ahead of a close
    ///
    /// The FM learns that the replica is down without waiting for the close to finish.
    pub fn read_write_status_revoked(
        &mut self,
        body: &ReplicaBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let Some(mode) = self.close_mode else {
            return;
        };
        if !mode.reports_down_on_revoke() {
            return;
        }
        let Some(local) = self.local_replica_mut() else {
            return;
        };
        if local.instance_id != body.replica.instance_id || !local.is_up {
            return;
        }
        local.mark_down();
        self.fm_message_state.on_replica_down();
        ctx.enable_update();
    }

    // ========================================================================
    // FM and node requests
    // ========================================================================

    /// Delete the local replica on the FM's request
    pub fn delete_replica(&mut self, body: &ReplicaBody, ctx: &mut FailoverUnitContext<'_>) {
        if self.is_stale_instance(&body.replica) {
            return;
        }
        if self.is_open() {
            self.start_close_local_replica(CloseMode::Delete, ctx);
            return;
        }

        if !self.local_replica_deleted {
            self.local_replica_deleted = true;
            if let Some(local) = self.local_replica_mut() {
                local.mark_dropped();
            }
            self.fm_message_state.reset();
            self.touch(ctx.now);
            ctx.enable_update();
        }
        let reply = self.local_reply(ReplyCode::Success).unwrap_or(ReplicaReplyBody {
            ft_id: self.id,
            cc_epoch: self.cc_epoch,
            replica: body.replica.clone(),
            code: ReplyCode::Success,
        });
        ctx.send_to_fm(Message::DeleteReplicaReply(reply));
    }

    /// Close the local replica for node deactivation
    pub fn deactivate_node(&mut self, ctx: &mut FailoverUnitContext<'_>) -> bool {
        if !self.is_open() || self.is_close_pending() {
            return false;
        }
        self.start_close_local_replica(CloseMode::DeactivateNode, ctx);
        true
    }

    /// Close the local replica for node shutdown
    pub fn close_for_node_shutdown(&mut self, ctx: &mut FailoverUnitContext<'_>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.start_close_local_replica(CloseMode::Close, ctx);
        true
    }
}
