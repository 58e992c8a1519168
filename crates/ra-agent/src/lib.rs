//! # Reconfiguration Agent Runtime
//!
//! The per-node runtime around the failover unit state machine.
//!
//! ## Purpose
//!
//! - [`ReconfigurationAgent`]: routes inbound messages to failover units, commits each change
//!   before its side effects run, and keeps the retry sets in line with committed state
//! - FM retry: one [`FMMessagePendingEntityList`] per failover manager enumerates the units
//!   owing it a report under a [`Throttle`] and batches them into `ReplicaUp` messages
//! - Node activation: one [`NodeDeactivationState`] per failover manager orders activation
//!   changes by sequence number and [`NodeDeactivationStateProcessor`] sweeps that owner's
//!   units when one is applied
//! - Node shutdown: [`ReconfigurationAgent::close`] closes hosted replicas within a bounded
//!   grace period and terminates the rest
//! - Background work: [`TaskRegistry`] owns every spawned task and cancels them on close
//!
//! ## Architecture Constraints
//!
//! This crate depends on:
//! - **ra-core**: identifiers, epochs, config, errors and effect traits
//! - **ra-entity**: the locked entity map, retry sets and durable store
//! - **ra-failover**: the failover unit state machine and message taxonomy
//!
//! The state machine never performs I/O; everything it asks for is executed here.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod agent;
pub mod builder;
mod close;
pub mod logging;
mod node_activation;
pub mod node_state;
pub mod pending;
pub mod task_registry;
pub mod throttle;

pub use agent::{AgentLifecycle, ReconfigurationAgent};
pub use builder::AgentBuilder;
pub use logging::init_tracing;
pub use node_activation::NodeDeactivationStateProcessor;
pub use node_state::{ChangeTicket, NodeDeactivationInfo, NodeDeactivationState};
pub use pending::{replica_up_batches, FMMessagePendingEntityList, RetryType};
pub use task_registry::{CancellationSource, TaskRegistry};
pub use throttle::{FixedThrottle, Throttle, TokenBucketThrottle};
