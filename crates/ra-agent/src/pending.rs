//! Throttled enumeration of failover units that owe their failover manager a report
//!
//! Reports travel in `ReplicaUp` batches. A retry pass enumerates at most the throttle's
//! budget of pending units, composes each report under the unit's own lock and marks it sent,
//! then hands the batches to the transport. The FM echoes each batch as `ReplicaUpReply`,
//! which clears the pending stage.

use crate::throttle::Throttle;
use ra_core::{FailoverConfig, NodeInstance, Timestamp};
use ra_entity::{EntityEntry, EntitySet};
use ra_failover::messages::{ReplicaReport, ReplicaUpBody};
use ra_failover::{FailoverUnit, FailoverUnitContext};
use std::sync::Arc;

/// What the caller should do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryType {
    /// Nothing is pending
    None,
    /// The throttle cut the pass short; run again as soon as the budget refills
    Immediate,
    /// Everything pending was enumerated; run again on the next periodic tick
    Deferred,
}

/// Pending set of one FM notification category plus its throttle
pub struct FMMessagePendingEntityList {
    set: EntitySet<FailoverUnit>,
    throttle: Arc<dyn Throttle>,
}

impl FMMessagePendingEntityList {
    /// Wrap `set` with `throttle`
    pub fn new(set: EntitySet<FailoverUnit>, throttle: Arc<dyn Throttle>) -> Self {
        Self { set, throttle }
    }

    /// Membership set
    pub fn set(&self) -> &EntitySet<FailoverUnit> {
        &self.set
    }

    /// Throttle charged by each pass
    pub fn throttle(&self) -> &Arc<dyn Throttle> {
        &self.throttle
    }

    /// Up to the throttle's budget of pending entries, in insertion order
    pub fn enumerate(&self, now: Timestamp) -> (Vec<Arc<EntityEntry<FailoverUnit>>>, RetryType) {
        let mut entries = self.set.snapshot();
        if entries.is_empty() {
            return (entries, RetryType::None);
        }
        let budget = self.throttle.count(now);
        let retry = if budget < entries.len() {
            RetryType::Immediate
        } else {
            RetryType::Deferred
        };
        entries.truncate(budget);
        (entries, retry)
    }

    /// Compose each entry's report and mark it sent, one lock scope per entry
    ///
    /// Entries that are no longer pending, or whose per-replica pacing has not elapsed, are
    /// skipped. The bookkeeping is in-memory only.
    pub async fn begin_update_entities_after_send(
        &self,
        entries: &[Arc<EntityEntry<FailoverUnit>>],
        node: NodeInstance,
        config: &FailoverConfig,
        now: Timestamp,
        sequence_number: u64,
    ) -> Vec<ReplicaReport> {
        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut locked = entry.lock().await;
            let ctx = FailoverUnitContext::new(node, config, now);
            let Some(report) = locked
                .get()
                .filter(|ft| ft.is_fm_report_due(&ctx))
                .and_then(FailoverUnit::fm_replica_report)
            else {
                continue;
            };
            locked
                .enable_in_memory_update()
                .on_fm_report_sent(now, sequence_number);
            match locked.commit().await {
                Ok(_) => reports.push(report),
                Err(err) => {
                    tracing::warn!(ft = %entry.id(), error = %err, "failed to record FM report");
                }
            }
        }
        self.throttle.update(reports.len(), now);
        reports
    }
}

/// Split reports into `ReplicaUp` messages of at most `max_per_message` entries
///
/// Dropped replicas travel in their own list. Only the final message carries `is_last`, and
/// only when `is_last` is set for the pass. `is_from_fmm` marks reports on FMM-owned units.
pub fn replica_up_batches(
    reports: Vec<ReplicaReport>,
    max_per_message: usize,
    is_last: bool,
    is_from_fmm: bool,
) -> Vec<ReplicaUpBody> {
    let max_per_message = max_per_message.max(1);
    let mut batches: Vec<ReplicaUpBody> = Vec::new();
    for chunk in reports.chunks(max_per_message) {
        let (dropped_replicas, replicas) = chunk
            .iter()
            .cloned()
            .partition(|report: &ReplicaReport| report.replica.is_dropped());
        batches.push(ReplicaUpBody {
            is_last: false,
            is_from_fmm,
            replicas,
            dropped_replicas,
        });
    }
    if let Some(last) = batches.last_mut() {
        last.is_last = is_last;
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::FixedThrottle;
    use ra_core::{Epoch, FailoverUnitId, ReplicaDescription, ReplicaState};
    use ra_entity::InMemoryLfumStore;

    fn report(n: u128, dropped: bool) -> ReplicaReport {
        let mut replica = ReplicaDescription::new(NodeInstance::new(1, 1), 1, 1);
        if dropped {
            replica.state = ReplicaState::Dropped;
        }
        ReplicaReport {
            ft_id: FailoverUnitId::from_u128(n),
            cc_epoch: Epoch::from_parts(1, 1, 0),
            replica,
        }
    }

    type Entries = Vec<Arc<EntityEntry<FailoverUnit>>>;

    /// The list holds weak references, so the owning entries are returned alongside it
    fn list_with(n: usize, throttle: usize) -> (FMMessagePendingEntityList, Entries) {
        let store = Arc::new(InMemoryLfumStore::new());
        let set = EntitySet::new("fm_pending");
        let list = FMMessagePendingEntityList::new(set, Arc::new(FixedThrottle(throttle)));
        let entries: Entries = (0..n)
            .map(|i| {
                let id = FailoverUnitId::from_u128(i as u128 + 1);
                Arc::new(EntityEntry::new(id, store.clone()))
            })
            .collect();
        for entry in &entries {
            list.set().add(entry);
        }
        (list, entries)
    }

    #[test]
    fn test_enumerate_empty() {
        let (list, _entries) = list_with(0, 10);
        let (entries, retry) = list.enumerate(Timestamp(0));
        assert!(entries.is_empty());
        assert_eq!(retry, RetryType::None);
    }

    #[test]
    fn test_enumerate_throttled_and_drained() {
        let (list, owned) = list_with(5, 2);
        let (entries, retry) = list.enumerate(Timestamp(0));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id(), owned[0].id());
        assert_eq!(retry, RetryType::Immediate);

        let (list, _owned) = list_with(5, 5);
        let (entries, retry) = list.enumerate(Timestamp(0));
        assert_eq!(entries.len(), 5);
        assert_eq!(retry, RetryType::Deferred);
    }

    #[test]
    fn test_batches_split_dropped_and_mark_last() {
        let reports = vec![report(1, false), report(2, true), report(3, false)];
        let batches = replica_up_batches(reports, 2, true, false);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].replicas.len(), 1);
        assert_eq!(batches[0].dropped_replicas.len(), 1);
        assert!(!batches[0].is_last);
        assert!(batches[1].is_last);

        let batches = replica_up_batches(vec![report(1, false)], 10, false, false);
        assert!(!batches[0].is_last);
        assert!(!batches[0].is_from_fmm);
        assert!(replica_up_batches(Vec::new(), 10, true, false).is_empty());
    }

    #[test]
    fn test_batches_carry_the_fmm_flag() {
        let reports = vec![report(1, false), report(2, false), report(3, true)];
        let batches = replica_up_batches(reports, 1, true, true);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|batch| batch.is_from_fmm));
    }
}
