//! Node shutdown
//!
//! Every open replica is asked to close. The agent then polls until all closes completed or
//! the graceful bound elapsed, and terminates whatever is still hosted. A zero bound skips
//! the graceful wait entirely. Both the deadline and the wait between polls are measured on
//! the agent's clock.

use crate::agent::{AgentLifecycle, ReconfigurationAgent};
use ra_core::{FailoverManagerId, FailoverUnitId, ReplicaHosting, Result};
use ra_failover::FailoverUnit;

impl ReconfigurationAgent {
    /// Close every hosted replica and stop the background work
    pub async fn close(&self, hosting: &dyn ReplicaHosting) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle_guard();
            match *lifecycle {
                AgentLifecycle::Open => *lifecycle = AgentLifecycle::Closing,
                AgentLifecycle::Created => {
                    *lifecycle = AgentLifecycle::Closed;
                    return Ok(());
                }
                AgentLifecycle::Closing | AgentLifecycle::Closed => return Ok(()),
            }
        }
        tracing::info!(node = %self.node, "closing reconfiguration agent");

        self.close_replicas(hosting).await;

        let sets = FailoverManagerId::ALL
            .iter()
            .map(|owner| self.fm_pending(*owner).set())
            .chain([self.message_retry()]);
        for set in sets {
            if let Some(timer) = set.timer() {
                timer.cancel();
            }
        }
        self.tasks.shutdown();
        self.set_lifecycle(AgentLifecycle::Closed);
        tracing::info!(node = %self.node, "reconfiguration agent closed");
        Ok(())
    }

    async fn close_replicas(&self, hosting: &dyn ReplicaHosting) {
        for entry in self.failover_units.entries() {
            let result = self
                .update_failover_unit(entry.id(), false, |locked, ctx| {
                    if !locked.get().is_some_and(FailoverUnit::is_open) {
                        return;
                    }
                    if locked.enable_in_memory_update().close_for_node_shutdown(ctx) {
                        locked.enable_update();
                    }
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(ft = %entry.id(), error = %err, "failed to start replica close");
            }
        }

        let max_duration = self.config.graceful_replica_shutdown_max_duration();
        if !max_duration.is_zero() {
            let deadline = self.clock.now() + max_duration;
            let check_interval = self.config.graceful_replica_close_completion_check_interval();
            loop {
                if self.open_failover_units().await.is_empty() {
                    return;
                }
                if self.clock.now() >= deadline {
                    break;
                }
                self.clock.sleep(check_interval).await;
            }
        }

        let remaining = self.open_failover_units().await;
        if remaining.is_empty() {
            return;
        }
        tracing::warn!(count = remaining.len(), bound = ?max_duration, "terminating replicas that did not close in time");
        for id in remaining {
            hosting.terminate_replica(id);
            let result = self
                .update_failover_unit(&id, false, |locked, ctx| {
                    if !locked.get().is_some_and(FailoverUnit::is_open) {
                        return;
                    }
                    locked.enable_in_memory_update().on_replica_terminated(ctx);
                    if ctx.is_update_requested() {
                        locked.enable_update();
                    }
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(ft = %id, error = %err, "failed to record replica termination");
            }
        }
    }

    async fn open_failover_units(&self) -> Vec<FailoverUnitId> {
        let mut open = Vec::new();
        for entry in self.failover_units.entries() {
            if entry.snapshot().await.is_some_and(|ft| ft.is_open()) {
                open.push(*entry.id());
            }
        }
        open
    }
}
