//! Execution context handed to failover unit operations

use crate::messages::{Endpoint, Envelope, Message};
use ra_core::{FailoverConfig, FailoverManagerId, NodeInstance, Timestamp};
use ra_entity::StateMachineActionQueue;

/// Everything a failover unit operation may read from its environment, plus the queue that
/// collects its side effects
#[derive(Debug)]
pub struct FailoverUnitContext<'a> {
    /// Node running this agent
    pub node: NodeInstance,
    /// Tunables
    pub config: &'a FailoverConfig,
    /// Time of the operation
    pub now: Timestamp,
    /// Failover manager owning the unit under operation
    pub owner: FailoverManagerId,
    /// Whether the owner has the node activated
    pub node_activated: bool,
    update_requested: bool,
    actions: StateMachineActionQueue<Envelope>,
}

impl<'a> FailoverUnitContext<'a> {
    /// Context for one operation
    pub fn new(node: NodeInstance, config: &'a FailoverConfig, now: Timestamp) -> Self {
        Self {
            node,
            config,
            now,
            owner: FailoverManagerId::Fm,
            node_activated: true,
            update_requested: false,
            actions: StateMachineActionQueue::new(),
        }
    }

    /// Route FM-bound messages to `owner`
    pub fn with_owner(mut self, owner: FailoverManagerId) -> Self {
        self.owner = owner;
        self
    }

    /// Set the node activation flag
    pub fn with_node_activated(mut self, node_activated: bool) -> Self {
        self.node_activated = node_activated;
        self
    }

    /// Ask for a durable commit of the scope
    ///
    /// Operations start from an in-memory update; anything that must survive a restart calls
    /// this.
    pub fn enable_update(&mut self) {
        self.update_requested = true;
    }

    /// Whether a durable commit was asked for
    pub fn is_update_requested(&self) -> bool {
        self.update_requested
    }

    /// Queue `message` for `target`
    pub fn send(&mut self, target: Endpoint, message: Message) {
        self.actions.send(Envelope::new(target, message));
    }

    /// Queue a message to the failover manager owning the unit
    pub fn send_to_fm(&mut self, message: Message) {
        self.send(Endpoint::failover_manager(self.owner), message);
    }

    /// Queue a message to the local replication proxy
    pub fn send_to_rap(&mut self, message: Message) {
        self.send(Endpoint::Rap, message);
    }

    /// Queue a message to another node's agent
    pub fn send_to_node(&mut self, node: NodeInstance, message: Message) {
        self.send(Endpoint::Node(node), message);
    }

    /// Queued side effects
    pub fn actions(&self) -> &StateMachineActionQueue<Envelope> {
        &self.actions
    }

    /// Mutable access to the queued side effects
    pub fn actions_mut(&mut self) -> &mut StateMachineActionQueue<Envelope> {
        &mut self.actions
    }

    /// Take the queued side effects, leaving the context empty
    pub fn take_actions(&mut self) -> StateMachineActionQueue<Envelope> {
        std::mem::take(&mut self.actions)
    }

    /// Queued messages, in order
    pub fn sent(&self) -> Vec<&Envelope> {
        self.actions.messages().collect()
    }
}
