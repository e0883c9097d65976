//! Caldera Protocol - WebSocket wire protocol for the relay daemon
//!
//! This crate provides message types and parsing for communication
//! between the daemon and its three kinds of clients: the relay
//! actuator, the temperature sensor, and observers (dashboards).
//!
//! Every frame is one JSON object discriminated by a `type` field.

pub mod error;
pub mod message;
pub mod parse;

pub use error::ProtocolError;
pub use message::{ChannelState, ClientMessage, ServerMessage};
pub use parse::{
    parse_frame, parse_registration, InboundFrame, RawCommand, RawConfigUpdate, RawRegister,
    RawStateQuery, RawStateReport, RawTelemetryReport, Registration, MAX_FRAME_SIZE,
};
