//! Reconfiguration Agent Core
//!
//! Foundational types shared by every layer of the reconfiguration agent:
//!
//! - **Identity**: [`NodeId`], [`NodeInstance`], [`FailoverUnitId`], [`FailoverManagerId`]
//! - **Ordering**: [`Epoch`] configuration generations and their staleness rules
//! - **Replicas**: roles, lifecycle states, [`ReplicaDescription`] and [`DeactivationInfo`]
//! - **Errors**: the unified [`RaError`] type
//! - **Configuration**: [`FailoverConfig`] with file/TOML loading
//! - **Effects**: injectable [`Clock`], [`ReplicaHosting`] and task/cancellation traits so
//!   that every timeout is evaluated deterministically in tests
//!
//! Nothing in this crate performs I/O on its own; higher layers inject the effects.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod effects;
pub mod epoch;
pub mod errors;
pub mod identity;
pub mod replica;

pub use config::FailoverConfig;
pub use effects::hosting::ReplicaHosting;
pub use effects::task::{CancellationToken, NeverCancel, TaskSpawner};
pub use effects::time::{Clock, SystemClock, Timestamp};
pub use epoch::Epoch;
pub use errors::{RaError, Result};
pub use identity::{FailoverManagerId, FailoverUnitId, NodeId, NodeInstance};
pub use replica::{
    DeactivationInfo, ReplicaDescription, ReplicaRole, ReplicaState, INVALID_LSN,
};
