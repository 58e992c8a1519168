//! Agent builder

use crate::agent::ReconfigurationAgent;
use crate::throttle::{Throttle, TokenBucketThrottle};
use ra_core::{Clock, FailoverConfig, NodeInstance, RaError, Result, SystemClock};
use ra_entity::{InMemoryLfumStore, LfumStore, MessageSink};
use ra_failover::Envelope;
use std::sync::Arc;

/// Builder for a [`ReconfigurationAgent`]
///
/// Only the message sink is required. The store defaults to an empty in-memory store, the
/// clock to the system clock and each failover manager's throttle to a token bucket sized
/// from the config.
pub struct AgentBuilder {
    node: NodeInstance,
    config: FailoverConfig,
    store: Option<Arc<dyn LfumStore>>,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn MessageSink<Envelope>>>,
    throttle: Option<Arc<dyn Throttle>>,
    fmm_throttle: Option<Arc<dyn Throttle>>,
}

impl AgentBuilder {
    /// Start building the agent of `node`
    pub fn new(node: NodeInstance) -> Self {
        Self {
            node,
            config: FailoverConfig::default(),
            store: None,
            clock: None,
            sink: None,
            throttle: None,
            fmm_throttle: None,
        }
    }

    /// Set the tunables
    pub fn with_config(mut self, config: FailoverConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the durable failover unit store
    pub fn with_store(mut self, store: Arc<dyn LfumStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set where outbound messages go
    pub fn with_sink(mut self, sink: Arc<dyn MessageSink<Envelope>>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the throttle on reports to the FM
    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Set the throttle on reports to the FMM
    pub fn with_fmm_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.fmm_throttle = Some(throttle);
        self
    }

    /// Validate the configuration and assemble the agent
    ///
    /// The agent starts in [`AgentLifecycle::Created`](crate::AgentLifecycle::Created);
    /// call [`ReconfigurationAgent::open`] to load the store.
    pub fn build(self) -> Result<Arc<ReconfigurationAgent>> {
        self.config.validate()?;
        let sink = self
            .sink
            .ok_or_else(|| RaError::invalid("a message sink is required"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryLfumStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let now = clock.now();
        let config = &self.config;
        let [fm_throttle, fmm_throttle] = [self.throttle, self.fmm_throttle].map(|throttle| {
            throttle.unwrap_or_else(|| {
                Arc::new(TokenBucketThrottle::from_config(config, now)) as Arc<dyn Throttle>
            })
        });

        tracing::debug!(node = %self.node, "assembling reconfiguration agent");
        Ok(ReconfigurationAgent::assemble(
            self.node,
            self.config,
            store,
            clock,
            sink,
            [fm_throttle, fmm_throttle],
        ))
    }
}
