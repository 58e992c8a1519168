//! # Reconfiguration Agent Testkit
//!
//! Shared fixtures for the agent's integration tests:
//!
//! - [`ControllableClock`]: a [`Clock`](ra_core::Clock) that only moves when told to
//! - [`RecordingMessageSink`] and [`RecordingHosting`]: capture what the agent sends and
//!   which replicas it terminates
//! - [`FailoverUnitBuilder`] and [`seed_store`]: put failover units into a store before the
//!   agent opens it
//! - [`strategies`]: proptest strategies for epochs and replica descriptions

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod builders;
pub mod clock;
pub mod recording;
pub mod strategies;

pub use builders::{seed_store, FailoverUnitBuilder};
pub use clock::ControllableClock;
pub use recording::{RecordingHosting, RecordingMessageSink};
