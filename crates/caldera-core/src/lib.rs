//! Caldera Core - Shared domain types for the boiler relay
//!
//! This crate provides the domain types shared between the wire
//! protocol (`caldera-protocol`) and the daemon (`calderad`):
//! node identities and roles, the canonical global state, and the
//! last-known-value cache.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod cache;
pub mod error;
pub mod node;
pub mod state;

// Re-exports for convenience
pub use cache::{CachedPayload, ChannelKey, StateCache, MAX_CHANNELS_PER_NODE};
pub use error::{DomainError, DomainResult};
pub use node::{
    ClientRole, ConnectionStatus, ControlBinding, NodeId, NodeRole, DEFAULT_ACTUATOR_ID,
    DEFAULT_SENSOR_ID,
};
pub use state::{ActuatorUpdate, GlobalState, Mode, OutputState, DEFAULT_TARGET_VALUE};
