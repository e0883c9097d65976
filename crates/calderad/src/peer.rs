//! Connection identities and outbound handles.
//!
//! Every accepted WebSocket gets a `ConnectionHandle`: a bounded queue
//! drained by the connection's writer task plus a close signal. The hub
//! only ever talks to clients through these handles, and sends never
//! block: a full or closed queue fails immediately.

use std::fmt;
use std::sync::Arc;

use caldera_core::{ClientRole, NodeId};
use caldera_protocol::{ProtocolError, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An encoded text frame, shared between recipients of a broadcast.
pub type Frame = Arc<str>;

/// Unique id of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendError {
    #[error("outbound queue full")]
    QueueFull,

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Outbound side of a connection.
///
/// Cheap to clone; all clones feed the same writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle and the receiver its writer task drains.
    pub fn channel(id: ConnectionId, buffer: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let handle = Self {
            id,
            sender,
            closed: CancellationToken::new(),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an already encoded frame.
    pub fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Encodes and queues a message.
    pub fn send(&self, message: &ServerMessage) -> Result<(), SendError> {
        let frame = message.to_frame()?;
        self.send_frame(Frame::from(frame))
    }

    /// Fire-and-forget send: failure is logged, never surfaced or retried.
    ///
    /// Returns whether the frame was queued.
    pub fn send_best_effort(&self, message: &ServerMessage) -> bool {
        match self.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    connection = %self.id,
                    message_type = message.type_name(),
                    error = %e,
                    "Best-effort send failed"
                );
                false
            }
        }
    }

    /// Signals the connection's tasks to shut down.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(connection = %self.id, "Closing connection");
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Token cancelled when the connection is closed by either side.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Registry key: hardware nodes by id, observers by connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Node(NodeId),
    Observer(ConnectionId),
}

impl PeerKey {
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Node(id) => Some(id),
            Self::Observer(_) => None,
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node {id}"),
            Self::Observer(conn) => write!(f, "observer {conn}"),
        }
    }
}

/// A registered connection as seen by its own read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub key: PeerKey,
    pub role: ClientRole,
    pub connection: ConnectionId,
}

impl Peer {
    pub fn node_id(&self) -> Option<&NodeId> {
        self.key.node_id()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.key, self.role, self.connection)
    }
}
