//! Node activation and deactivation driven by the FM and the FMM
//!
//! Each failover manager activates the node for the units it owns, with its own sequence
//! numbers. An accepted change is acknowledged to its issuer right away; the sweep over that
//! owner's failover units runs in the background and stops early if a newer change from the
//! same owner cancels it.

use crate::agent::ReconfigurationAgent;
use crate::node_state::{ChangeTicket, NodeDeactivationInfo};
use ra_core::{CancellationToken, FailoverManagerId, TaskSpawner};
use ra_entity::CommitOutcome;
use ra_failover::messages::{NodeActivationBody, NodeUpAckBody};
use ra_failover::{Endpoint, FailoverUnit, Message};
use std::sync::Arc;

/// Fans an accepted activation change out to the failover units of one owner
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeDeactivationStateProcessor;

impl NodeDeactivationStateProcessor {
    /// Close every open unit (deactivation) or reopen every down unit (activation) that
    /// `owner` manages
    ///
    /// Cancellation is checked between units. Returns the number of units changed.
    pub async fn process_activation_state_change(
        agent: &ReconfigurationAgent,
        owner: FailoverManagerId,
        info: NodeDeactivationInfo,
        token: &dyn CancellationToken,
    ) -> usize {
        let mut changed = 0;
        for entry in agent.failover_units.entries() {
            if FailoverManagerId::for_failover_unit(entry.id()) != owner {
                continue;
            }
            if token.is_cancelled() {
                tracing::debug!(%owner, change = %info, changed, "node activation sweep cancelled");
                return changed;
            }
            let result = agent
                .update_failover_unit(entry.id(), false, |locked, ctx| {
                    let eligible = locked.get().is_some_and(|ft| {
                        if info.is_activated {
                            ft.is_closed()
                        } else {
                            ft.is_open() && !ft.is_close_pending()
                        }
                    });
                    if !eligible {
                        return;
                    }
                    let ft: &mut FailoverUnit = locked.enable_in_memory_update();
                    let applied = if info.is_activated {
                        ft.reopen_down_replica(ctx)
                    } else {
                        ft.deactivate_node(ctx)
                    };
                    if applied && ctx.is_update_requested() {
                        locked.enable_update();
                    }
                })
                .await;
            match result {
                Ok(CommitOutcome::Durable(_)) => changed += 1,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(ft = %entry.id(), %owner, change = %info, error = %err, "node activation change not applied");
                }
            }
        }
        tracing::info!(%owner, change = %info, changed, "node activation sweep complete");
        changed
    }
}

impl ReconfigurationAgent {
    /// Apply an activation or deactivation request from the FM or the FMM
    ///
    /// Accepted requests and duplicates of the applied state are acknowledged to the issuer;
    /// older requests are dropped.
    pub(crate) fn process_node_activation_request(
        &self,
        body: NodeActivationBody,
        is_activated: bool,
    ) {
        let owner = FailoverManagerId::from_is_fmm(body.is_fmm);
        let state = self.node_state(owner);
        let info = NodeDeactivationInfo {
            is_activated,
            sequence_number: body.sequence_number,
        };
        let ticket = state.try_start_change(info);
        if ticket.is_none() && state.current() != info {
            return;
        }

        let reply = if is_activated {
            Message::NodeActivateReply(body)
        } else {
            Message::NodeDeactivateReply(body)
        };
        self.send(Endpoint::failover_manager(owner), reply);
        if let Some(ticket) = ticket {
            self.start_activation_sweep(owner, ticket);
        }
    }

    /// Apply the FM's or the FMM's acknowledgement of this node coming up
    pub(crate) fn process_node_up_ack(&self, body: NodeUpAckBody) {
        let owner = FailoverManagerId::from_is_fmm(body.is_fmm);
        let state = self.node_state(owner);
        let info = NodeDeactivationInfo {
            is_activated: body.is_activated,
            sequence_number: body.sequence_number,
        };
        let ticket = state.try_start_change(info);
        state.on_node_up_ack_processed();
        tracing::info!(node = %self.node, %owner, state = %state.current(), "node up acknowledged");
        if let Some(ticket) = ticket {
            self.start_activation_sweep(owner, ticket);
        }
    }

    fn start_activation_sweep(&self, owner: FailoverManagerId, ticket: ChangeTicket) {
        let Some(agent) = self.strong_self() else {
            return;
        };
        let Some(token) = self.node_state(owner).finish_change(ticket) else {
            return;
        };
        let sweep_token = Arc::clone(&token);
        TaskSpawner::spawn_cancellable(
            &self.tasks,
            Box::pin(async move {
                NodeDeactivationStateProcessor::process_activation_state_change(
                    &agent,
                    owner,
                    ticket.info,
                    sweep_token.as_ref(),
                )
                .await;
                agent.node_state(owner).on_sweep_completed(ticket);
            }),
            token,
        );
    }
}
