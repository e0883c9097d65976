//! Connection handler for individual WebSocket clients.
//!
//! Each connection gets its own `ConnectionHandler` that:
//! - Waits for the registration handshake
//! - Registers the client with the hub
//! - Parses incoming frames and dispatches them to the hub
//! - Drains the outbound queue through a separate writer task
//!
//! Once registered, a connection always reports its disconnect to the
//! hub, including when the task is cancelled or panics.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use caldera_protocol::{
    parse_frame, parse_registration, ProtocolError, Registration, ServerMessage,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ServerSettings;
use crate::hub::{DisconnectReason, HubError, HubHandle};
use crate::peer::{ConnectionHandle, ConnectionId, Frame, Peer};

/// Connection handler for a single client.
pub struct ConnectionHandler {
    socket: WebSocket,
    connection: ConnectionId,
    address: SocketAddr,
    hub: HubHandle,
    settings: ServerSettings,

    /// Daemon-wide shutdown signal
    cancel_token: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        socket: WebSocket,
        connection: ConnectionId,
        address: SocketAddr,
        hub: HubHandle,
        settings: ServerSettings,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket,
            connection,
            address,
            hub,
            settings,
            cancel_token,
        }
    }

    /// Runs the connection until either side closes it.
    pub async fn run(self) {
        let Self {
            socket,
            connection,
            address,
            hub,
            settings,
            cancel_token,
        } = self;

        debug!(connection = %connection, address = %address, "Client connected");

        let (handle, outbound) = ConnectionHandle::channel(connection, settings.outbound_buffer);
        let (sink, mut stream) = socket.split();
        let mut writer = tokio::spawn(write_loop(
            sink,
            outbound,
            handle.closed_token(),
            settings.write_timeout,
            connection,
        ));

        let registration = match timeout(
            settings.handshake_timeout,
            read_registration(&mut stream, &cancel_token),
        )
        .await
        {
            Ok(Ok(registration)) => registration,
            Ok(Err(e)) => {
                reject(&handle, connection, &e);
                drop(handle);
                finish_writer(&mut writer, settings.write_timeout).await;
                return;
            }
            Err(_) => {
                let e = ConnectionError::HandshakeTimeout(settings.handshake_timeout);
                reject(&handle, connection, &e);
                drop(handle);
                finish_writer(&mut writer, settings.write_timeout).await;
                return;
            }
        };

        let peer = match hub
            .register(handle.clone(), registration, Some(address.to_string()))
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                reject(&handle, connection, &ConnectionError::Rejected(e));
                drop(handle);
                finish_writer(&mut writer, settings.write_timeout).await;
                return;
            }
        };

        info!(peer = %peer, address = %address, "Client registered");

        let mut guard = DisconnectGuard::new(hub.clone(), peer.clone());
        let closed = handle.closed_token();

        let reason = loop {
            let message = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break DisconnectReason::Shutdown,
                _ = closed.cancelled() => break DisconnectReason::WriterClosed,
                message = stream.next() => message,
            };

            match message {
                None | Some(Ok(Message::Close(_))) => break DisconnectReason::Closed,
                Some(Err(e)) => {
                    debug!(peer = %peer, error = %e, "Read failed");
                    break DisconnectReason::TransportError;
                }
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(frame) => {
                        if hub.dispatch(peer.clone(), frame).await.is_err() {
                            break DisconnectReason::Shutdown;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Ignoring unparseable frame");
                    }
                },
                Some(Ok(Message::Binary(data))) => {
                    debug!(peer = %peer, bytes = data.len(), "Ignoring binary frame");
                }
                // Control frames are answered by the WebSocket layer
                Some(Ok(_)) => {}
            }
        };

        guard.set_reason(reason);
        drop(guard);

        handle.close();
        drop(handle);
        finish_writer(&mut writer, settings.write_timeout).await;

        info!(peer = %peer, reason = ?reason, "Client disconnected");
    }
}

/// Reads frames until the first text frame and validates it as a
/// registration.
async fn read_registration(
    stream: &mut SplitStream<WebSocket>,
    cancel_token: &CancellationToken,
) -> Result<Registration, ConnectionError> {
    loop {
        let message = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => return Err(ConnectionError::Shutdown),
            message = stream.next() => message,
        };

        match message {
            None | Some(Ok(Message::Close(_))) => return Err(ConnectionError::Eof),
            Some(Err(e)) => return Err(ConnectionError::Io(e.to_string())),
            Some(Ok(Message::Text(text))) => {
                return parse_registration(&text).map_err(ConnectionError::Handshake);
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(ConnectionError::UnexpectedMessage(
                    "binary frame".to_string(),
                ));
            }
            Some(Ok(_)) => {}
        }
    }
}

/// Logs a failed handshake and tells the client why, if it broke the
/// protocol.
fn reject(handle: &ConnectionHandle, connection: ConnectionId, error: &ConnectionError) {
    if error.is_violation() {
        warn!(connection = %connection, error = %error, "Handshake failed");
        handle.send_best_effort(&ServerMessage::error(&error.to_string()));
    } else {
        debug!(connection = %connection, error = %error, "Connection ended before registration");
    }
}

/// Drains the outbound queue into the socket.
///
/// Stops when the queue's senders are gone, the connection is closed, or
/// a write fails or times out. Any stop closes the connection so later
/// sends fail fast.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    write_timeout: Duration,
    connection: ConnectionId,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match timeout(write_timeout, sink.send(Message::Text(frame.to_string()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = %connection, error = %e, "Write failed");
                break;
            }
            Err(_) => {
                warn!(
                    connection = %connection,
                    timeout_secs = write_timeout.as_secs(),
                    "Write timed out, closing connection"
                );
                break;
            }
        }
    }

    closed.cancel();
    let _ = timeout(write_timeout, sink.close()).await;
}

async fn finish_writer(writer: &mut JoinHandle<()>, deadline: Duration) {
    if timeout(deadline, &mut *writer).await.is_err() {
        writer.abort();
    }
}

/// Reports the disconnect to the hub when dropped.
struct DisconnectGuard {
    hub: HubHandle,
    peer: Option<Peer>,
    reason: DisconnectReason,
}

impl DisconnectGuard {
    fn new(hub: HubHandle, peer: Peer) -> Self {
        Self {
            hub,
            peer: Some(peer),
            // Unwinding out of the read loop counts as a transport failure
            reason: DisconnectReason::TransportError,
        }
    }

    fn set_reason(&mut self, reason: DisconnectReason) {
        self.reason = reason;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.take() {
            self.hub.disconnect_detached(peer, self.reason);
        }
    }
}

/// Errors that end a connection before it is registered.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid registration: {0}")]
    Handshake(ProtocolError),

    #[error("No registration within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Registration rejected: {0}")]
    Rejected(HubError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Server shutting down")]
    Shutdown,
}

impl ConnectionError {
    /// Whether the client broke the protocol and should get an error frame.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_)
                | Self::HandshakeTimeout(_)
                | Self::UnexpectedMessage(_)
                | Self::Rejected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubCommand;
    use crate::peer::PeerKey;
    use caldera_core::ClientRole;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::Handshake(ProtocolError::MissingField("role"));
        assert!(err.to_string().contains("role"));

        let err = ConnectionError::HandshakeTimeout(Duration::from_secs(10));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_violations_get_error_frame() {
        assert!(ConnectionError::Handshake(ProtocolError::EmptyNodeId).is_violation());
        assert!(ConnectionError::Rejected(HubError::MissingNodeId).is_violation());
        assert!(!ConnectionError::Eof.is_violation());
        assert!(!ConnectionError::Shutdown.is_violation());
    }

    #[test]
    fn test_reject_queues_error_frame() {
        let (handle, mut rx) = ConnectionHandle::channel(ConnectionId::new(1), 4);

        reject(
            &handle,
            ConnectionId::new(1),
            &ConnectionError::Handshake(ProtocolError::MissingField("role")),
        );
        reject(&handle, ConnectionId::new(1), &ConnectionError::Eof);

        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_guard_reports_disconnect_on_drop() {
        let (tx, mut rx) = mpsc::channel(4);
        let peer = Peer {
            key: PeerKey::Observer(ConnectionId::new(7)),
            role: ClientRole::Observer,
            connection: ConnectionId::new(7),
        };

        let mut guard = DisconnectGuard::new(HubHandle::new(tx), peer.clone());
        guard.set_reason(DisconnectReason::Closed);
        drop(guard);

        match rx.recv().await {
            Some(HubCommand::Disconnect {
                peer: reported,
                reason,
            }) => {
                assert_eq!(reported, peer);
                assert_eq!(reason, DisconnectReason::Closed);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_guard_defaults_to_transport_error() {
        let (tx, mut rx) = mpsc::channel(4);
        let peer = Peer {
            key: PeerKey::Observer(ConnectionId::new(8)),
            role: ClientRole::Observer,
            connection: ConnectionId::new(8),
        };

        drop(DisconnectGuard::new(HubHandle::new(tx), peer));

        assert!(matches!(
            rx.recv().await,
            Some(HubCommand::Disconnect {
                reason: DisconnectReason::TransportError,
                ..
            })
        ));
    }
}
