//! Reconfiguration Agent Failover Unit
//!
//! The per-partition state machine of the reconfiguration agent:
//!
//! - **Entity**: [`FailoverUnit`] with its [`ReplicaStore`], epochs and single-slot trackers
//!   ([`FMMessageState`], [`EndpointPublishState`], [`RetryableErrorState`])
//! - **Reconfiguration**: the phased protocol (Demote, GetLSN, Catchup, Deactivate, Activate)
//!   driven from `DoReconfiguration` on the new primary, and its secondary-side counterpart
//! - **Lifecycle**: opening, closing, faulting and deleting the local replica, plus building
//!   idle replicas from the primary
//! - **Messages**: the [`Message`] taxonomy and its dispatcher metadata table
//! - **Processing**: [`process_message`] admits a message against the committed unit and
//!   applies it under the entity lock
//!
//! Operations never perform I/O. They queue outbound messages on a [`FailoverUnitContext`]
//! and request a durable commit when the change must survive a restart.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod build;
pub mod context;
pub mod endpoint_publish;
pub mod failover_unit;
mod fm;
pub mod fm_message_state;
mod lifecycle;
pub mod messages;
mod phases;
pub mod processor;
pub mod reconfiguration;
mod reconfigure;
pub mod replica;
pub mod retryable_error;
mod secondary;

#[cfg(test)]
mod test_support;

pub use context::FailoverUnitContext;
pub use endpoint_publish::{EndpointPublishAck, EndpointPublishState};
pub use failover_unit::{FailoverUnit, FailoverUnitState, LockedFailoverUnitPtr, OpenReplyTarget};
pub use fm_message_state::{FMMessageStage, FMMessageState};
pub use messages::{Endpoint, Envelope, Message, MessageKind, MessageMetadata};
pub use phases::ReadQuorum;
pub use processor::process_message;
pub use reconfiguration::{
    ReconfigurationResult, ReconfigurationStage, ReconfigurationState, ReconfigurationType,
};
pub use replica::{Replica, ReplicaLsn, ReplicaMessageStage, ReplicaStore};
pub use retryable_error::{RetryableErrorAction, RetryableErrorState, RetryableErrorStateName};
pub use secondary::get_lsn_not_found_reply;
