//! The reconfiguration agent of one node
//!
//! Every message is applied to at most one failover unit under that unit's lock. The outbound
//! messages and async work an operation produces are executed only after its commit succeeds;
//! a failed commit rolls the unit back and discards them. Units that still owe something
//! join the retry sets, whose timers drive the background passes.
//!
//! The FM and the FMM each own their failover units: each has its own activation latch,
//! pending report set and retry pass.

use crate::node_state::NodeDeactivationState;
use crate::pending::{replica_up_batches, FMMessagePendingEntityList, RetryType};
use crate::task_registry::TaskRegistry;
use crate::throttle::Throttle;
use parking_lot::Mutex;
use ra_core::{
    Clock, FailoverConfig, FailoverManagerId, FailoverUnitId, NodeInstance, RaError, Result,
};
use ra_entity::{CommitOutcome, EntityMap, EntitySet, LfumStore, MessageSink, RetryTimer};
use ra_failover::messages::ReplicaUpBody;
use ra_failover::{
    processor, Endpoint, Envelope, FailoverUnit, FailoverUnitContext, LockedFailoverUnitPtr,
    Message,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Where the agent is in its own lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLifecycle {
    /// Built but not opened; nothing is processed
    Created,
    /// Processing messages and running background passes
    Open,
    /// Node shutdown in progress; only close-time messages are processed
    Closing,
    /// Shut down
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum BackgroundPass {
    FmMessageRetry(FailoverManagerId),
    ReconfigurationMessageRetry,
}

/// One value per failover manager
#[derive(Debug)]
pub(crate) struct PerOwner<T> {
    fm: T,
    fmm: T,
}

impl<T> PerOwner<T> {
    fn new(mut make: impl FnMut(FailoverManagerId) -> T) -> Self {
        Self {
            fm: make(FailoverManagerId::Fm),
            fmm: make(FailoverManagerId::Fmm),
        }
    }

    pub(crate) fn get(&self, owner: FailoverManagerId) -> &T {
        match owner {
            FailoverManagerId::Fm => &self.fm,
            FailoverManagerId::Fmm => &self.fmm,
        }
    }
}

/// Per-node dispatcher over the failover units
pub struct ReconfigurationAgent {
    pub(crate) node: NodeInstance,
    pub(crate) config: FailoverConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sink: Arc<dyn MessageSink<Envelope>>,
    pub(crate) tasks: TaskRegistry,
    pub(crate) failover_units: EntityMap<FailoverUnit>,
    node_states: PerOwner<NodeDeactivationState>,
    fm_pending: PerOwner<FMMessagePendingEntityList>,
    message_retry: EntitySet<FailoverUnit>,
    lifecycle: Mutex<AgentLifecycle>,
    replica_up_sequence: AtomicU64,
    weak_self: Weak<ReconfigurationAgent>,
}

impl std::fmt::Debug for ReconfigurationAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconfigurationAgent")
            .field("node", &self.node)
            .field("lifecycle", &self.lifecycle())
            .field("failover_units", &self.failover_units.len())
            .finish()
    }
}

impl ReconfigurationAgent {
    pub(crate) fn assemble(
        node: NodeInstance,
        config: FailoverConfig,
        store: Arc<dyn LfumStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MessageSink<Envelope>>,
        throttles: [Arc<dyn Throttle>; 2],
    ) -> Arc<Self> {
        let [fm_throttle, fmm_throttle] = throttles;
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let fm_pending = PerOwner::new(|owner| {
                let (name, throttle) = match owner {
                    FailoverManagerId::Fm => ("fm_message_pending", Arc::clone(&fm_throttle)),
                    FailoverManagerId::Fmm => ("fmm_message_pending", Arc::clone(&fmm_throttle)),
                };
                let timer = RetryTimer::new(
                    name,
                    config.fm_message_retry_interval(),
                    Self::timer_callback(weak.clone(), BackgroundPass::FmMessageRetry(owner)),
                );
                FMMessagePendingEntityList::new(
                    EntitySet::new(name).with_timer(Arc::new(timer)),
                    throttle,
                )
            });
            let retry_timer = RetryTimer::new(
                "reconfiguration_message_retry",
                config.reconfiguration_message_retry_interval(),
                Self::timer_callback(weak.clone(), BackgroundPass::ReconfigurationMessageRetry),
            );

            Self {
                node,
                config,
                clock,
                sink,
                tasks: TaskRegistry::new(),
                failover_units: EntityMap::new(store),
                node_states: PerOwner::new(|_| NodeDeactivationState::new()),
                fm_pending,
                message_retry: EntitySet::new("reconfiguration_message_retry")
                    .with_timer(Arc::new(retry_timer)),
                lifecycle: Mutex::new(AgentLifecycle::Created),
                replica_up_sequence: AtomicU64::new(0),
                weak_self: weak.clone(),
            }
        })
    }

    fn timer_callback(weak: Weak<Self>, pass: BackgroundPass) -> impl Fn() + Send + Sync + 'static {
        move || {
            let Some(agent) = weak.upgrade() else {
                return;
            };
            let task_agent = Arc::clone(&agent);
            agent.tasks.spawn(async move { task_agent.run_pass(pass).await });
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Node this agent runs on
    pub fn node(&self) -> NodeInstance {
        self.node
    }

    /// Tunables
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Lifecycle state
    pub fn lifecycle(&self) -> AgentLifecycle {
        *self.lifecycle.lock()
    }

    /// Activation latch `owner` drives
    pub fn node_state(&self, owner: FailoverManagerId) -> &NodeDeactivationState {
        self.node_states.get(owner)
    }

    /// Background task registry
    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// All failover unit entries
    pub fn failover_units(&self) -> &EntityMap<FailoverUnit> {
        &self.failover_units
    }

    /// Committed state of one failover unit
    pub async fn failover_unit(&self, id: &FailoverUnitId) -> Option<FailoverUnit> {
        let entry = self.failover_units.get_entry(id)?;
        entry.snapshot().await
    }

    /// Units owing `owner` a report
    pub fn fm_pending(&self, owner: FailoverManagerId) -> &FMMessagePendingEntityList {
        self.fm_pending.get(owner)
    }

    /// Units with reconfiguration messages to resend
    pub fn message_retry(&self) -> &EntitySet<FailoverUnit> {
        &self.message_retry
    }

    pub(crate) fn strong_self(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: AgentLifecycle) {
        *self.lifecycle.lock() = lifecycle;
    }

    pub(crate) fn lifecycle_guard(&self) -> parking_lot::MutexGuard<'_, AgentLifecycle> {
        self.lifecycle.lock()
    }

    pub(crate) fn send(&self, target: Endpoint, message: Message) {
        self.sink.send(Envelope::new(target, message));
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Load the stored failover units and start the background passes
    ///
    /// Nothing is hosted after a restart: loaded units are closed and owe the FM a report.
    /// Returns the number of units loaded.
    pub async fn open(&self) -> Result<usize> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != AgentLifecycle::Created {
                return Err(RaError::invalid(format!(
                    "agent on node {} cannot open from {:?}",
                    self.node, *lifecycle
                )));
            }
            *lifecycle = AgentLifecycle::Open;
        }

        let loaded = match self.failover_units.load().await {
            Ok(loaded) => loaded,
            Err(err) => {
                self.set_lifecycle(AgentLifecycle::Created);
                return Err(err);
            }
        };
        for entry in self.failover_units.entries() {
            self.update_failover_unit(entry.id(), false, |locked, ctx| {
                if !locked.is_present() {
                    return;
                }
                if locked.enable_in_memory_update().on_node_start(ctx.now) {
                    locked.enable_update();
                }
            })
            .await?;
        }

        let weak = self.weak_self.clone();
        self.tasks
            .spawn_interval_until(self.config.tombstone_cleanup_interval(), move || {
                let weak = weak.clone();
                async move {
                    let Some(agent) = weak.upgrade() else {
                        return false;
                    };
                    agent.cleanup_tombstones().await;
                    true
                }
            });

        tracing::info!(node = %self.node, loaded, "reconfiguration agent open");
        Ok(loaded)
    }

    // ========================================================================
    // Message dispatch
    // ========================================================================

    /// Apply one inbound message
    ///
    /// Stale and inapplicable messages are absorbed. The only error is a failed commit, in
    /// which case the unit is unchanged and nothing was sent.
    pub async fn process_message(&self, from: Endpoint, message: Message) -> Result<()> {
        let kind = message.kind();
        match self.lifecycle() {
            AgentLifecycle::Open => {}
            AgentLifecycle::Closing if message.metadata().process_during_node_close => {}
            lifecycle => {
                tracing::debug!(kind = ?kind, lifecycle = ?lifecycle, "message dropped by lifecycle");
                return Ok(());
            }
        }

        match &message {
            Message::ReplicaUpReply(body) => return self.process_replica_up_reply(body).await,
            Message::NodeActivateRequest(body) => {
                self.process_node_activation_request(*body, true);
                return Ok(());
            }
            Message::NodeDeactivateRequest(body) => {
                self.process_node_activation_request(*body, false);
                return Ok(());
            }
            Message::NodeUpAck(body) => {
                self.process_node_up_ack(*body);
                return Ok(());
            }
            _ => {}
        }

        let Some(ft_id) = message.ft_id() else {
            tracing::debug!(kind = ?kind, "message without a failover unit ignored");
            return Ok(());
        };
        self.update_failover_unit(&ft_id, true, |locked, ctx| {
            processor::process_message(locked, &from, &message, ctx);
        })
        .await
        .map(|_| ())
    }

    async fn process_replica_up_reply(&self, body: &ReplicaUpBody) -> Result<()> {
        for report in body.replicas.iter().chain(&body.dropped_replicas) {
            if self.failover_units.get_entry(&report.ft_id).is_none() {
                tracing::debug!(ft = %report.ft_id, "ReplicaUpReply for unknown failover unit");
                continue;
            }
            self.update_failover_unit(&report.ft_id, false, |locked, ctx| {
                if !locked.get().is_some_and(FailoverUnit::needs_fm_message) {
                    return;
                }
                locked
                    .enable_in_memory_update()
                    .process_replica_up_reply(report, ctx);
                if ctx.is_update_requested() {
                    locked.enable_update();
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Run `op` on the locked unit `id`, commit, then execute or abandon its side effects
    ///
    /// The unit stays locked until its retry set membership matches the committed state and
    /// an empty placeholder entry has been evicted, so concurrent updates of the same unit
    /// observe these in commit order. A missing unit is a no-op unless `create_if_missing`.
    pub(crate) async fn update_failover_unit<F>(
        &self,
        id: &FailoverUnitId,
        create_if_missing: bool,
        op: F,
    ) -> Result<CommitOutcome>
    where
        F: FnOnce(&mut LockedFailoverUnitPtr, &mut FailoverUnitContext<'_>),
    {
        let Some(mut locked) = self.failover_units.lock_entry(id, create_if_missing).await else {
            return Ok(CommitOutcome::NoOp);
        };
        let owner = FailoverManagerId::for_failover_unit(id);
        let mut ctx = FailoverUnitContext::new(self.node, &self.config, self.clock.now())
            .with_owner(owner)
            .with_node_activated(self.node_state(owner).is_activated());
        op(&mut locked, &mut ctx);

        let actions = ctx.take_actions();
        match locked.commit().await {
            Ok(outcome) => {
                let membership = locked
                    .get()
                    .map(|ft| (ft.needs_fm_message(), ft.needs_message_resend()));
                let (fm_pending, resend) = membership.unwrap_or((false, false));
                self.fm_pending(owner)
                    .set()
                    .reconcile(locked.entry(), fm_pending);
                self.message_retry.reconcile(locked.entry(), resend);
                if membership.is_none() {
                    self.failover_units.remove_if_empty(&locked);
                }
                actions.execute(self.sink.as_ref(), &self.tasks);
                Ok(outcome)
            }
            Err(err) => {
                let dropped = actions.abandon();
                tracing::error!(ft = %id, error = %err, dropped, "commit failed; side effects discarded");
                self.failover_units.remove_if_empty(&locked);
                Err(err)
            }
        }
    }

    // ========================================================================
    // Background passes
    // ========================================================================

    async fn run_pass(&self, pass: BackgroundPass) {
        match pass {
            BackgroundPass::FmMessageRetry(owner) => loop {
                match self.retry_fm_messages(owner).await {
                    RetryType::Immediate => self.clock.sleep(self.throttle_backoff()).await,
                    RetryType::Deferred => {
                        Self::rearm(self.fm_pending(owner).set());
                        return;
                    }
                    RetryType::None => return,
                }
            },
            BackgroundPass::ReconfigurationMessageRetry => {
                self.retry_reconfiguration_messages().await;
                Self::rearm(&self.message_retry);
            }
        }
    }

    fn rearm(set: &EntitySet<FailoverUnit>) {
        if set.is_empty() {
            return;
        }
        if let Some(timer) = set.timer() {
            timer.set();
        }
    }

    fn throttle_backoff(&self) -> Duration {
        self.config
            .per_node_minimum_interval_between_message_to_fm()
            .max(Duration::from_millis(1))
    }

    /// One FM message retry pass for the units `owner` manages
    ///
    /// Sends the reports of up to the throttle's budget of pending units as `ReplicaUp`
    /// batches to `owner`. Units stay pending until the owner echoes them back.
    pub async fn retry_fm_messages(&self, owner: FailoverManagerId) -> RetryType {
        if self.lifecycle() != AgentLifecycle::Open {
            return RetryType::None;
        }
        let pending = self.fm_pending(owner);
        let now = self.clock.now();
        let (entries, retry) = pending.enumerate(now);
        if entries.is_empty() {
            return retry;
        }

        let sequence_number = self.replica_up_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let reports = pending
            .begin_update_entities_after_send(&entries, self.node, &self.config, now, sequence_number)
            .await;
        if reports.is_empty() {
            return retry;
        }

        let count = reports.len();
        let is_last = retry != RetryType::Immediate;
        let batches = replica_up_batches(
            reports,
            self.config.max_fm_messages_per_replica_up,
            is_last,
            owner.is_fmm(),
        );
        for body in batches {
            self.send(Endpoint::failover_manager(owner), Message::ReplicaUp(body));
        }
        tracing::debug!(%owner, reports = count, sequence_number, retry = ?retry, "sent ReplicaUp");
        retry
    }

    /// One reconfiguration message retry pass; returns the number of units visited
    pub async fn retry_reconfiguration_messages(&self) -> usize {
        if self.lifecycle() != AgentLifecycle::Open {
            return 0;
        }
        let mut visited = 0;
        for entry in self.message_retry.snapshot() {
            let result = self
                .update_failover_unit(entry.id(), false, |locked, ctx| {
                    if !locked.get().is_some_and(FailoverUnit::needs_message_resend) {
                        return;
                    }
                    locked
                        .enable_in_memory_update()
                        .on_reconfiguration_retry_timer(ctx);
                    if ctx.is_update_requested() {
                        locked.enable_update();
                    }
                })
                .await;
            match result {
                Ok(CommitOutcome::NoOp) => {}
                Ok(_) => visited += 1,
                Err(err) => {
                    tracing::warn!(ft = %entry.id(), error = %err, "reconfiguration retry failed");
                }
            }
        }
        visited
    }

    /// Delete units whose tombstone retention elapsed; returns how many were removed
    pub async fn cleanup_tombstones(&self) -> usize {
        let retention = self.config.deleted_failover_unit_tombstone_duration();
        let mut removed = 0;
        for entry in self.failover_units.entries() {
            let mut expired = false;
            let result = self
                .update_failover_unit(entry.id(), false, |locked, ctx| {
                    if locked
                        .get()
                        .is_some_and(|ft| ft.is_tombstone_expired(ctx.now, retention))
                    {
                        expired = true;
                        locked.mark_for_delete();
                    }
                })
                .await;
            match result {
                Ok(_) if expired => removed += 1,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(ft = %entry.id(), error = %err, "tombstone cleanup failed");
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed expired failover unit tombstones");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::AgentBuilder;
    use crate::throttle::FixedThrottle;
    use ra_core::{Epoch, NodeId, ReplicaDescription, ReplicaRole};
    use ra_entity::InMemoryLfumStore;
    use ra_failover::messages::{ReplicaBody, ReplyCode};
    use ra_testkit::{ControllableClock, RecordingMessageSink};

    fn ft_id() -> FailoverUnitId {
        FailoverUnitId::from_u128(7)
    }

    fn local() -> NodeInstance {
        NodeInstance::new(1, 1)
    }

    async fn open_agent(
        store: Arc<InMemoryLfumStore>,
    ) -> (Arc<ReconfigurationAgent>, Arc<RecordingMessageSink>) {
        let sink = Arc::new(RecordingMessageSink::new());
        let agent = AgentBuilder::new(local())
            .with_store(store)
            .with_clock(Arc::new(ControllableClock::new(1_000)))
            .with_sink(sink.clone())
            .with_throttle(Arc::new(FixedThrottle(100)))
            .build()
            .unwrap();
        agent.open().await.unwrap();
        (agent, sink)
    }

    fn add_primary() -> Message {
        let replica = ReplicaDescription::new(local(), 1, 1)
            .with_roles(ReplicaRole::None, ReplicaRole::Primary);
        Message::AddPrimary(ReplicaBody {
            ft_id: ft_id(),
            cc_epoch: Epoch::from_parts(1, 1, 0),
            replica,
            is_persisted: true,
        })
    }

    #[tokio::test]
    async fn test_messages_dropped_before_open() {
        let sink = Arc::new(RecordingMessageSink::new());
        let agent = AgentBuilder::new(local())
            .with_sink(sink.clone())
            .build()
            .unwrap();
        agent.process_message(Endpoint::Fm, add_primary()).await.unwrap();
        assert!(agent.failover_unit(&ft_id()).await.is_none());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_add_primary_opens_replica_and_joins_retry_set() {
        let store = Arc::new(InMemoryLfumStore::new());
        let (agent, sink) = open_agent(store.clone()).await;
        agent.process_message(Endpoint::Fm, add_primary()).await.unwrap();

        let ft = agent.failover_unit(&ft_id()).await.unwrap();
        assert!(ft.is_open());
        assert_eq!(ft.owner(), NodeId(1));
        assert_eq!(store.write_count(), 1);
        assert!(agent.message_retry().contains(&ft_id()));
        assert!(sink
            .take()
            .iter()
            .any(|e| e.target == Endpoint::Rap && matches!(e.message, Message::ReplicaOpen(_))));
    }

    #[tokio::test]
    async fn test_commit_failure_sends_nothing() {
        let store = Arc::new(InMemoryLfumStore::new());
        let (agent, sink) = open_agent(store.clone()).await;
        store.fail_next_writes(1);

        let err = agent
            .process_message(Endpoint::Fm, add_primary())
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert!(sink.is_empty());
        assert!(agent.failover_unit(&ft_id()).await.is_none());
        assert!(agent.failover_units().is_empty());
        assert!(!agent.message_retry().contains(&ft_id()));
    }

    #[tokio::test]
    async fn test_reply_for_unknown_unit_leaves_no_placeholder() {
        let (agent, sink) = open_agent(Arc::new(InMemoryLfumStore::new())).await;
        let reply = ra_failover::messages::ReplicaReplyBody {
            ft_id: ft_id(),
            cc_epoch: Epoch::from_parts(1, 1, 0),
            replica: ReplicaDescription::new(local(), 1, 1),
            code: ReplyCode::Success,
        };
        agent
            .process_message(Endpoint::Rap, Message::ReplicaOpenReply(reply))
            .await
            .unwrap();
        assert!(agent.failover_units().is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_second_open_rejected() {
        let (agent, _sink) = open_agent(Arc::new(InMemoryLfumStore::new())).await;
        assert!(agent.open().await.is_err());
        assert_eq!(agent.lifecycle(), AgentLifecycle::Open);
    }
}
