//! Protocol errors.

use thiserror::Error;

/// Errors raised while decoding or encoding frames.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not match any message shape
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Node id must not be empty")]
    EmptyNodeId,

    /// First frame of a connection was not a registration
    #[error("Expected register message, got {0}")]
    ExpectedRegister(&'static str),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}
