//! WebSocket server for the relay daemon.
//!
//! The server:
//! - Accepts WebSocket upgrades on `GET /ws`
//! - Spawns a `ConnectionHandler` for each client
//! - Hands registered connections to the hub
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │                 │
//! │  axum Router    │
//! └───────┬─────────┘
//!         │ upgrade
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│    HubHandle    │
//! │   (per client)  │     │                 │
//! └───────┬─────────┘     └─────────────────┘
//!         │
//!         │ outbound queue
//!         ▼
//! ┌─────────────────┐
//! │   writer task   │
//! └─────────────────┘
//! ```

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use caldera_protocol::MAX_FRAME_SIZE;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::HubHandle;
use crate::peer::ConnectionId;

/// Path of the WebSocket endpoint.
pub const WS_PATH: &str = "/ws";

/// Time a client has to send its registration (10 seconds)
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard ceiling enforced by the WebSocket layer (1 MiB).
///
/// Kept well above `MAX_FRAME_SIZE` so an oversized protocol frame reaches
/// `parse_frame` and is ignored instead of tearing down the connection.
pub const TRANSPORT_MESSAGE_LIMIT: usize = 16 * MAX_FRAME_SIZE;

/// Per-connection transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,

    /// Deadline for a single socket write
    pub write_timeout: Duration,

    pub handshake_timeout: Duration,

    /// Largest inbound message the transport accepts before closing
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            write_timeout: Duration::from_secs(10),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_message_size: TRANSPORT_MESSAGE_LIMIT,
        }
    }
}

/// State shared by the upgrade handler.
#[derive(Clone)]
struct ServerState {
    hub: HubHandle,
    settings: ServerSettings,
    cancel_token: CancellationToken,

    /// Source of connection ids
    connection_counter: Arc<AtomicU64>,
}

impl ServerState {
    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// WebSocket server for the relay daemon.
pub struct RelayServer {
    listen: SocketAddr,
    state: ServerState,
}

impl RelayServer {
    /// Creates a new relay server.
    ///
    /// # Arguments
    ///
    /// * `listen` - Address to bind in [`RelayServer::run`]
    /// * `hub` - Handle to the hub actor
    /// * `cancel_token` - Token for graceful shutdown
    /// * `settings` - Per-connection transport settings
    pub fn new(
        listen: SocketAddr,
        hub: HubHandle,
        cancel_token: CancellationToken,
        settings: ServerSettings,
    ) -> Self {
        Self {
            listen,
            state: ServerState {
                hub,
                settings,
                cancel_token,
                connection_counter: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    /// Builds the HTTP router.
    pub fn router(&self) -> Router {
        Router::new()
            .route(WS_PATH, get(ws_handler))
            .with_state(self.state.clone())
    }

    /// Binds the configured address and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.listen,
                error: e.to_string(),
            })?;

        self.serve(listener).await
    }

    /// Serves on an already bound listener until cancelled.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, path = WS_PATH, "Relay server listening");

        let cancel_token = self.state.cancel_token.clone();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!("Server shutdown requested");
        })
        .await?;

        info!(
            connections = self.state.connection_counter.load(Ordering::Relaxed),
            "Server stopped"
        );
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(address): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> Response {
    let connection = state.next_connection_id();
    debug!(connection = %connection, address = %address, "WebSocket upgrade");

    ws.max_message_size(state.settings.max_message_size)
        .on_upgrade(move |socket| {
            let handler = ConnectionHandler::new(
                socket,
                connection,
                address,
                state.hub,
                state.settings,
                state.cancel_token,
            );
            handler.run()
        })
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
