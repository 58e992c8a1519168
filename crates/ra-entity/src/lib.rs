//! Entity framework for the reconfiguration agent
//!
//! Gives every tracked object single-writer semantics and a cheap commit path:
//!
//! - [`EntityMap`] owns [`EntityEntry`] values keyed by id
//! - [`EntityEntry::lock`] yields the only [`LockedEntityPtr`] for that entry
//! - [`LockedEntityPtr::commit`] classifies the scope as no-op, in-memory or durable and writes
//!   the [`LfumStore`] only when required
//! - [`StateMachineActionQueue`] holds the side effects of a scope until its commit succeeds
//! - [`EntitySet`] tracks entities awaiting a background pass, arming a [`RetryTimer`]

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod action_queue;
pub mod entity;
pub mod map;
pub mod set;
pub mod store;
pub mod timer;

pub use action_queue::{MessageSink, StateMachineAction, StateMachineActionQueue};
pub use entity::{CommitDescription, CommitOutcome, Entity, EntityEntry, LockedEntityPtr, UpdateContext};
pub use map::EntityMap;
pub use set::EntitySet;
pub use store::{InMemoryLfumStore, LfumStore, RowType, StoreOperationType};
pub use timer::RetryTimer;
