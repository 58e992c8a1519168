//! Reports owed to the FM and the background retry hooks of a failover unit

use crate::context::FailoverUnitContext;
use crate::endpoint_publish::EndpointPublishAck;
use crate::failover_unit::{FailoverUnit, FailoverUnitState};
use crate::fm_message_state::FMMessageStage;
use crate::messages::{EndpointBody, Message, ReplicaReplyBody, ReplicaReport};
use crate::reconfiguration::ReconfigurationResult;
use ra_core::{DeactivationInfo, ReplicaState, Timestamp};

impl FailoverUnit {
    /// Report the FM is owed, in the form it goes into a `ReplicaUp` batch
    ///
    /// Dropped reports always carry a dropped, down description.
    pub fn fm_replica_report(&self) -> Option<ReplicaReport> {
        if !self.fm_message_state.is_pending() {
            return None;
        }
        let mut replica = self.local_description()?;
        if self.fm_message_state.stage() == FMMessageStage::ReplicaDropped {
            replica.state = ReplicaState::Dropped;
            replica.is_up = false;
        }
        Some(ReplicaReport {
            ft_id: self.id,
            cc_epoch: self.cc_epoch,
            replica,
        })
    }

    /// Whether the owed report may be sent now under the per-replica pacing
    pub fn is_fm_report_due(&self, ctx: &FailoverUnitContext<'_>) -> bool {
        self.fm_message_state.should_retry(
            ctx.now,
            ctx.config.per_replica_minimum_interval_between_message_to_fm(),
        )
    }

    /// Record that the owed report went out
    ///
    /// Retry bookkeeping is in-memory only.
    pub fn on_fm_report_sent(&mut self, now: Timestamp, sequence_number: u64) {
        self.fm_message_state.on_sent(now, sequence_number);
    }

    /// Apply the FM's echo of a `ReplicaUp` entry
    pub fn process_replica_up_reply(
        &mut self,
        report: &ReplicaReport,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        let stage = self.fm_message_state.stage();
        let local_instance = self.local_instance().unwrap_or_default();
        if !self
            .fm_message_state
            .on_acknowledged(&report.replica, local_instance)
        {
            tracing::debug!(ft = %self.id, stage = ?stage, replica = %report.replica.node, "stale ReplicaUpReply");
            return;
        }
        tracing::debug!(ft = %self.id, stage = ?stage, "FM acknowledged replica report");
        ctx.enable_update();
    }

    /// Bring a unit loaded from the store in line with a freshly started node
    ///
    /// Nothing is hosted after a restart. Persisted replicas are down and uploaded to the FM;
    /// volatile replicas lost their state and are dropped. Returns whether the unit changed.
    pub fn on_node_start(&mut self, now: Timestamp) -> bool {
        let Some(local) = self.local_replica() else {
            return false;
        };
        if self.local_replica_deleted || local.is_dropped() {
            return false;
        }

        if self.is_closed() {
            self.fm_message_state.on_replica_upload();
            return self.fm_message_state.is_pending();
        }

        self.state = FailoverUnitState::Closed;
        self.open_mode = None;
        self.open_reply_to = None;
        self.close_mode = None;
        self.sender_node = None;
        self.message_retry_active = false;
        self.endpoint_publish.clear();
        if self.is_reconfiguring() {
            self.reconfiguration.finish(ReconfigurationResult::None);
            self.reset_reconfiguration_states();
        }

        if self.is_persisted {
            if let Some(local) = self.local_replica_mut() {
                local.mark_down();
            }
            self.fm_message_state.reset();
            self.fm_message_state.on_replica_upload();
        } else {
            if let Some(local) = self.local_replica_mut() {
                local.mark_dropped();
            }
            self.deactivation_info = DeactivationInfo::Dropped;
            self.fm_message_state.on_dropped();
        }
        self.touch(now);
        true
    }

    // ========================================================================
    // Endpoint publication
    // ========================================================================

    /// Record the endpoint the hosted replica reported
    ///
    /// A primary's endpoint is published to the FM after the configured delay unless a
    /// reconfiguration reply carries it first.
    pub fn process_proxy_endpoint_updated(
        &mut self,
        body: &EndpointBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        if !self.is_local_replica_open()
            || !self
                .local_replica()
                .is_some_and(|r| r.instance_id == body.replica.replica.instance_id)
        {
            return;
        }
        self.endpoint = body.endpoint.clone();
        if self.is_local_primary() {
            self.endpoint_publish.start(self.cc_epoch, ctx.now);
        }
        self.touch(ctx.now);
        ctx.enable_update();
    }

    /// Apply the FM's reply to a published endpoint
    pub fn process_endpoint_updated_reply(
        &mut self,
        body: &ReplicaReplyBody,
        ctx: &mut FailoverUnitContext<'_>,
    ) {
        match self
            .endpoint_publish
            .on_fm_reply(body.cc_epoch, body.code.is_success())
        {
            EndpointPublishAck::Accepted => ctx.enable_update(),
            EndpointPublishAck::Rearmed => {
                tracing::debug!(ft = %self.id, epoch = %body.cc_epoch, code = ?body.code, "endpoint publish rearmed");
            }
            EndpointPublishAck::Ignored => {}
        }
    }

    fn publish_endpoint_if_due(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        let due = self.endpoint_publish.on_reconfiguration_timer(
            ctx.now,
            ctx.config.max_wait_before_publish_endpoint(),
            ctx.config.reconfiguration_message_retry_interval(),
        );
        if !due {
            return;
        }
        if let Some(replica) = self.local_replica_body() {
            tracing::debug!(ft = %self.id, epoch = %self.cc_epoch, "publishing endpoint");
            ctx.send_to_fm(Message::ReplicaEndpointUpdated(EndpointBody {
                replica,
                endpoint: self.endpoint.clone(),
            }));
        }
    }

    // ========================================================================
    // Background passes
    // ========================================================================

    /// Body of the reconfiguration message retry pass
    ///
    /// Time-bounded phases are re-checked before anything is resent.
    pub fn on_reconfiguration_retry_timer(&mut self, ctx: &mut FailoverUnitContext<'_>) {
        if let Some(last) = self.last_message_resend {
            if ctx.now.saturating_since(last) < ctx.config.reconfiguration_message_retry_interval()
            {
                return;
            }
        }
        self.check_reconfiguration_progress(ctx);
        self.resend_reconfiguration_messages(ctx);
        self.publish_endpoint_if_due(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ReplyCode;
    use crate::test_support::*;
    use assert_matches::assert_matches;
    use ra_core::{FailoverConfig, ReplicaRole};
    use std::time::Duration;

    fn primary() -> FailoverUnit {
        open_ft(
            epoch(2, 1, 0),
            &[
                (1, ReplicaRole::Primary, true),
                (2, ReplicaRole::Secondary, true),
            ],
        )
    }

    #[test]
    fn test_down_report_then_acknowledged() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = primary();
        ft.fm_message_state.on_replica_down();
        if let Some(local) = ft.local_replica_mut() {
            local.mark_down();
        }

        let report = ft.fm_replica_report().expect("report owed");
        assert!(!report.replica.is_up);
        assert!(ft.is_fm_report_due(&ctx));
        ft.on_fm_report_sent(ctx.now, 7);
        assert!(!ft.is_fm_report_due(&ctx));

        let mut up = report.clone();
        up.replica.is_up = true;
        ft.process_replica_up_reply(&up, &mut ctx);
        assert!(ft.needs_fm_message());
        assert!(!ctx.is_update_requested());

        ft.process_replica_up_reply(&report, &mut ctx);
        assert!(!ft.needs_fm_message());
        assert!(ctx.is_update_requested());
    }

    #[test]
    fn test_report_pacing() {
        let config = FailoverConfig::default();
        let mut ft = primary();
        ft.fm_message_state.on_replica_up();
        ft.on_fm_report_sent(NOW, 1);

        let mut ctx = context(&config);
        ctx.now = NOW + Duration::from_millis(config.per_replica_minimum_interval_between_message_to_fm_ms);
        assert!(ft.is_fm_report_due(&ctx));
    }

    #[test]
    fn test_dropped_report_carries_dropped_description() {
        let mut ft = primary();
        ft.fm_message_state.on_dropped();
        let report = ft.fm_replica_report().expect("report owed");
        assert!(report.replica.is_dropped());
        assert!(!report.replica.is_up);
    }

    #[test]
    fn test_node_start_marks_persisted_replica_down() {
        let mut ft = primary();
        assert!(ft.on_node_start(NOW));
        assert!(ft.is_closed());
        assert!(!ft.is_local_replica_up());
        assert_eq!(ft.fm_message_state().stage(), FMMessageStage::ReplicaUpload);

        let mut volatile = primary();
        volatile.is_persisted = false;
        assert!(volatile.on_node_start(NOW));
        assert!(volatile.is_local_replica_dropped());
        assert_eq!(
            volatile.fm_message_state().stage(),
            FMMessageStage::ReplicaDropped
        );
    }

    #[test]
    fn test_endpoint_published_after_delay() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = primary();
        let body = EndpointBody {
            replica: replica_body(epoch(2, 1, 0), ft.local_description().expect("local")),
            endpoint: "tcp://node1:7000".into(),
        };
        ft.process_proxy_endpoint_updated(&body, &mut ctx);
        assert!(ft.endpoint_publish().is_pending());
        assert!(ft.needs_message_resend());

        let mut ctx = context(&config);
        ft.on_reconfiguration_retry_timer(&mut ctx);
        assert!(ctx.sent().is_empty());

        let mut ctx = context(&config);
        ctx.now = NOW + config.max_wait_before_publish_endpoint();
        ft.on_reconfiguration_retry_timer(&mut ctx);
        assert_matches!(
            &ctx.sent()[0].message,
            Message::ReplicaEndpointUpdated(b) if b.endpoint == "tcp://node1:7000"
        );

        let stale = ReplicaReplyBody {
            ft_id: ft_id(),
            cc_epoch: epoch(2, 0, 0),
            replica: body.replica.replica.clone(),
            code: ReplyCode::Success,
        };
        ft.process_endpoint_updated_reply(&stale, &mut ctx);
        assert!(ft.endpoint_publish().is_pending());

        let ack = ReplicaReplyBody {
            cc_epoch: epoch(2, 1, 0),
            ..stale
        };
        ft.process_endpoint_updated_reply(&ack, &mut ctx);
        assert!(!ft.endpoint_publish().is_pending());
    }

    #[test]
    fn test_endpoint_from_old_instance_ignored() {
        let config = FailoverConfig::default();
        let mut ctx = context(&config);
        let mut ft = primary();
        let mut desc = ft.local_description().expect("local");
        desc.instance_id = 0;
        let body = EndpointBody {
            replica: replica_body(epoch(2, 1, 0), desc),
            endpoint: "tcp://old".into(),
        };
        ft.process_proxy_endpoint_updated(&body, &mut ctx);
        assert!(!ft.endpoint_publish().is_pending());
        assert!(ft.endpoint().is_empty());
    }
}
