//! Injectable effects
//!
//! Time, task spawning and forced replica termination are the only ambient effects the agent
//! needs. All are traits so tests can drive timeouts deterministically.

pub mod hosting;
pub mod task;
pub mod time;
