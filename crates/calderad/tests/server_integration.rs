//! Integration tests for the WebSocket server.
//!
//! These run a `RelayServer` on an ephemeral port and talk to it with a
//! real WebSocket client, covering the handshake, protocol violations,
//! frame routing and disconnect handling.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::time::Duration;

use calderad::hub::{spawn_hub, HubHandle, HubSettings};
use calderad::server::{RelayServer, ServerSettings, WS_PATH};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for an expected frame
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between hub state checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test server context that manages server lifecycle.
struct TestServer {
    addr: SocketAddr,
    hub: HubHandle,
    cancel_token: CancellationToken,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(ServerSettings::default()).await
    }

    async fn spawn_with(settings: ServerSettings) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let hub = spawn_hub(HubSettings::default());
        let cancel_token = CancellationToken::new();
        let server = RelayServer::new(addr, hub.clone(), cancel_token.clone(), settings);

        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            addr,
            hub,
            cancel_token,
        }
    }

    async fn connect(&self) -> Client {
        let url = format!("ws://{}{}", self.addr, WS_PATH);
        let (client, _response) = connect_async(url).await.expect("connect to server");
        client
    }

    /// Connects and registers, returning the client after its ack.
    async fn register(&self, role: &str, id: Option<&str>) -> Client {
        let mut client = self.connect().await;
        let mut frame = json!({ "type": "register", "role": role });
        if let Some(id) = id {
            frame["id"] = json!(id);
        }
        send_json(&mut client, &frame).await;

        let ack = recv_type(&mut client, "registered").await;
        assert_eq!(ack["id"], id.map_or(Value::Null, |id| json!(id)));
        client
    }

    /// Polls the hub until it holds `expected` connections.
    async fn wait_for_connections(&self, expected: usize) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < RECV_TIMEOUT {
            if self.hub.stats().await.expect("hub running").connections() == expected {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!("hub did not reach {expected} connections within {RECV_TIMEOUT:?}");
    }

    fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

async fn send_json(client: &mut Client, value: &Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

/// Next JSON text frame.
async fn recv_json(client: &mut Client) -> Value {
    loop {
        let message = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("valid frame");

        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("frame is JSON");
        }
    }
}

/// Skips frames until one of the given type arrives.
async fn recv_type(client: &mut Client, message_type: &str) -> Value {
    loop {
        let frame = recv_json(client).await;
        if frame["type"] == message_type {
            return frame;
        }
    }
}

/// Waits for the server to close the connection.
async fn expect_closed(client: &mut Client) {
    loop {
        match timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("close within timeout")
        {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(_)) => {}
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_observer_receives_ack_and_snapshot() {
    let server = TestServer::spawn().await;
    let mut observer = server.register("observer", None).await;

    let snapshot = recv_json(&mut observer).await;
    assert_eq!(snapshot["type"], "full_state_update");
    assert_eq!(snapshot["system_state"]["output_state"], "OFF");
    assert_eq!(snapshot["connection_status"]["esp32_02"], "disconnected");

    server.shutdown();
}

#[tokio::test]
async fn test_non_register_first_frame_is_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    send_json(
        &mut client,
        &json!({ "type": "command", "to": "esp32_02", "action": "on" }),
    )
    .await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("register"));
    expect_closed(&mut client).await;
    assert_eq!(server.hub.stats().await.unwrap().connections(), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_roleless_register_is_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    send_json(&mut client, &json!({ "type": "register", "id": "esp32_02" })).await;

    assert_eq!(recv_json(&mut client).await["type"], "error");
    expect_closed(&mut client).await;

    server.shutdown();
}

#[tokio::test]
async fn test_role_conflict_is_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    send_json(
        &mut client,
        &json!({ "type": "register", "role": "sensor", "id": "esp32_02" }),
    )
    .await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("esp32_02"));
    expect_closed(&mut client).await;

    server.shutdown();
}

#[tokio::test]
async fn test_silent_client_closed_after_handshake_timeout() {
    let server = TestServer::spawn_with(ServerSettings {
        handshake_timeout: Duration::from_millis(100),
        ..ServerSettings::default()
    })
    .await;
    let mut client = server.connect().await;

    assert_eq!(recv_json(&mut client).await["type"], "error");
    expect_closed(&mut client).await;

    server.shutdown();
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_command_round_trip() {
    let server = TestServer::spawn().await;
    let mut actuator = server.register("actuator", Some("esp32_02")).await;
    let mut observer = server.register("observer", None).await;

    let command = json!({ "type": "command", "to": "esp32_02", "device": "relay", "action": "on" });
    send_json(&mut observer, &command).await;

    let received = recv_json(&mut actuator).await;
    assert_eq!(received, command);

    send_json(
        &mut actuator,
        &json!({ "type": "status_update", "relay_state": "ON" }),
    )
    .await;

    // Interlock holds the output OFF while the sensor is missing
    let snapshot = recv_type(&mut observer, "full_state_update").await;
    assert_eq!(snapshot["system_state"]["output_state"], "OFF");

    server.shutdown();
}

#[tokio::test]
async fn test_command_to_absent_node_reports_offline() {
    let server = TestServer::spawn().await;
    let mut observer = server.register("observer", None).await;

    send_json(
        &mut observer,
        &json!({ "type": "command", "to": "esp32_09", "action": "off" }),
    )
    .await;

    let notice = recv_type(&mut observer, "node_offline").await;
    assert_eq!(notice["id"], "esp32_09");

    server.shutdown();
}

#[tokio::test]
async fn test_garbage_after_registration_is_ignored() {
    let server = TestServer::spawn().await;
    let mut observer = server.register("observer", None).await;

    observer
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    send_json(&mut observer, &json!({ "type": "ping" })).await;

    recv_type(&mut observer, "pong").await;
    assert_eq!(server.hub.stats().await.unwrap().observers, 1);

    server.shutdown();
}

#[tokio::test]
async fn test_oversized_frame_from_node_is_ignored() {
    let server = TestServer::spawn().await;
    let mut actuator = server.register("actuator", Some("esp32_02")).await;
    let mut observer = server.register("observer", None).await;
    server.wait_for_connections(2).await;

    let padding = "x".repeat(caldera_protocol::MAX_FRAME_SIZE + 1024);
    send_json(
        &mut actuator,
        &json!({ "type": "state_report", "output": "ON", "pad": padding }),
    )
    .await;
    send_json(&mut actuator, &json!({ "type": "ping" })).await;

    recv_type(&mut actuator, "pong").await;
    assert_eq!(server.hub.stats().await.unwrap().actuators, 1);

    // No offline notice reached the observer
    send_json(&mut observer, &json!({ "type": "ping" })).await;
    loop {
        let frame = recv_json(&mut observer).await;
        assert_ne!(frame["type"], "node_offline");
        if frame["type"] == "pong" {
            break;
        }
    }

    server.shutdown();
}

// ============================================================================
// Disconnects
// ============================================================================

#[tokio::test]
async fn test_actuator_disconnect_notifies_observers() {
    let server = TestServer::spawn().await;
    let mut actuator = server.register("actuator", Some("esp32_02")).await;
    let _sensor = server.register("sensor", Some("esp32_03")).await;
    let mut observer = server.register("observer", None).await;
    server.wait_for_connections(3).await;

    actuator.close(None).await.unwrap();

    let notice = recv_type(&mut observer, "node_offline").await;
    assert_eq!(notice["id"], "esp32_02");
    server.wait_for_connections(2).await;

    let snapshot = server.hub.snapshot().await.unwrap();
    assert_eq!(snapshot.state.output_state, caldera_core::OutputState::Off);

    server.shutdown();
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestServer::spawn().await;
    let mut observer = server.register("observer", None).await;

    server.shutdown();

    expect_closed(&mut observer).await;
}
