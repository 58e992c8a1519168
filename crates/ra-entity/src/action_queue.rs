//! Side effects deferred until after commit
//!
//! State machine code never sends a message or starts async work while holding an entity
//! lock. It appends actions here instead; the caller runs them once the commit result is
//! known, or abandons them if the commit failed.

use futures::future::BoxFuture;
use ra_core::TaskSpawner;
use std::fmt;

/// Destination for outbound messages
pub trait MessageSink<M>: Send + Sync {
    /// Hand a message to the transport
    fn send(&self, message: M);
}

/// One deferred side effect
pub enum StateMachineAction<M> {
    /// Send a message
    SendMessage(M),
    /// Start an async operation
    ScheduleAsync(BoxFuture<'static, ()>),
    /// Run a callback after a successful commit
    ScheduleCommitCallback(Box<dyn FnOnce() + Send>),
}

impl<M: fmt::Debug> fmt::Debug for StateMachineAction<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateMachineAction::SendMessage(m) => f.debug_tuple("SendMessage").field(m).finish(),
            StateMachineAction::ScheduleAsync(_) => f.write_str("ScheduleAsync"),
            StateMachineAction::ScheduleCommitCallback(_) => {
                f.write_str("ScheduleCommitCallback")
            }
        }
    }
}

/// Ordered list of deferred side effects
pub struct StateMachineActionQueue<M> {
    actions: Vec<StateMachineAction<M>>,
}

impl<M> Default for StateMachineActionQueue<M> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for StateMachineActionQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.actions).finish()
    }
}

impl<M> StateMachineActionQueue<M> {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message
    pub fn send(&mut self, message: M) {
        self.actions.push(StateMachineAction::SendMessage(message));
    }

    /// Queue an async operation
    pub fn schedule_async(&mut self, fut: BoxFuture<'static, ()>) {
        self.actions.push(StateMachineAction::ScheduleAsync(fut));
    }

    /// Queue a commit callback
    pub fn on_commit<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.actions
            .push(StateMachineAction::ScheduleCommitCallback(Box::new(callback)));
    }

    /// Number of queued actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Queued messages, in order
    pub fn messages(&self) -> impl Iterator<Item = &M> {
        self.actions.iter().filter_map(|action| match action {
            StateMachineAction::SendMessage(m) => Some(m),
            _ => None,
        })
    }

    /// Move all actions of `other` to the end of this queue
    pub fn append(&mut self, other: &mut StateMachineActionQueue<M>) {
        self.actions.append(&mut other.actions);
    }

    /// Run every action in order
    pub fn execute(self, sink: &dyn MessageSink<M>, spawner: &dyn TaskSpawner) {
        for action in self.actions {
            match action {
                StateMachineAction::SendMessage(message) => sink.send(message),
                StateMachineAction::ScheduleAsync(fut) => spawner.spawn(fut),
                StateMachineAction::ScheduleCommitCallback(callback) => callback(),
            }
        }
    }

    /// Discard every action; returns how many were dropped
    pub fn abandon(self) -> usize {
        self.actions.len()
    }
}
