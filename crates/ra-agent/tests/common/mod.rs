#![allow(dead_code)]

use ra_agent::{AgentBuilder, FixedThrottle, ReconfigurationAgent};
use ra_core::{
    Epoch, FailoverConfig, FailoverManagerId, FailoverUnitId, NodeInstance, ReplicaDescription,
    ReplicaRole,
};
use ra_entity::InMemoryLfumStore;
use ra_failover::messages::{ReplicaBody, ReplicaReplyBody, ReplyCode};
use ra_failover::{Endpoint, FailoverUnit, Message};
use ra_testkit::{seed_store, ControllableClock, FailoverUnitBuilder, RecordingMessageSink};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub agent: Arc<ReconfigurationAgent>,
    pub store: Arc<InMemoryLfumStore>,
    pub clock: Arc<ControllableClock>,
    pub sink: Arc<RecordingMessageSink>,
}

pub fn local() -> NodeInstance {
    NodeInstance::new(1, 1)
}

/// FM-owned failover unit `n`
pub fn ft(n: u128) -> FailoverUnitId {
    FailoverUnitId::from_u128(0x1000 + n)
}

/// The FMM-owned partition of the FM service
pub fn fm_service() -> FailoverUnitId {
    FailoverUnitId::FM_SERVICE
}

/// Persisted unit whose local replica is the primary on node 1
pub fn persisted_primary(id: FailoverUnitId) -> FailoverUnit {
    FailoverUnitBuilder::new(id)
        .replica(local(), ReplicaRole::Primary)
        .build()
}

pub async fn open_with(config: FailoverConfig, seeded: &[FailoverUnit], throttle: usize) -> Harness {
    let store = Arc::new(InMemoryLfumStore::new());
    seed_store(store.as_ref(), seeded).await.unwrap();
    let clock = Arc::new(ControllableClock::new(1_000));
    let sink = Arc::new(RecordingMessageSink::new());
    let agent = AgentBuilder::new(local())
        .with_config(config)
        .with_store(store.clone())
        .with_clock(clock.clone())
        .with_sink(sink.clone())
        .with_throttle(Arc::new(FixedThrottle(throttle)))
        .build()
        .unwrap();
    agent.open().await.unwrap();
    Harness {
        agent,
        store,
        clock,
        sink,
    }
}

pub async fn open(seeded: &[FailoverUnit]) -> Harness {
    open_with(FailoverConfig::default(), seeded, 100).await
}

pub fn add_primary(id: FailoverUnitId, cc_epoch: Epoch) -> Message {
    Message::AddPrimary(ReplicaBody {
        ft_id: id,
        cc_epoch,
        replica: ReplicaDescription::new(local(), 1, 1)
            .with_roles(ReplicaRole::None, ReplicaRole::Primary),
        is_persisted: true,
    })
}

/// Success reply for the replica carried by a `ReplicaOpen` or `ReplicaClose`
pub fn success_reply(message: &Message) -> ReplicaReplyBody {
    let body = match message {
        Message::ReplicaOpen(b) => &b.replica,
        Message::ReplicaClose(b) => &b.replica,
        other => panic!("no replica request in {other:?}"),
    };
    ReplicaReplyBody {
        ft_id: body.ft_id,
        cc_epoch: body.cc_epoch,
        replica: body.replica.clone(),
        code: ReplyCode::Success,
    }
}

/// Open a new primary replica through `AddPrimary` and the hosting layer's reply
pub async fn open_primary(h: &Harness, id: FailoverUnitId, cc_epoch: Epoch) {
    h.agent
        .process_message(Endpoint::Fm, add_primary(id, cc_epoch))
        .await
        .unwrap();
    let open = h
        .sink
        .take()
        .into_iter()
        .find(|e| matches!(e.message, Message::ReplicaOpen(_)))
        .unwrap();
    h.agent
        .process_message(Endpoint::Rap, Message::ReplicaOpenReply(success_reply(&open.message)))
        .await
        .unwrap();
    h.sink.take();
}

/// Yield until `done` holds; the spawned work runs on the same test runtime
pub async fn settle<F: Fn() -> bool>(done: F) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never held");
}

pub async fn settle_sweep(agent: &ReconfigurationAgent) {
    for _ in 0..1_000 {
        let in_flight = FailoverManagerId::ALL
            .iter()
            .any(|owner| agent.node_state(*owner).is_sweep_in_flight());
        if !in_flight {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("activation sweep never completed");
}
