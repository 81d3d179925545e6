//! End-to-end tests over real WebSocket connections.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::{serve, Registry, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Value>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, username: &str) -> Self {
        let url = format!("ws://{}/ws?username={}", addr, username);
        let (ws, _) = connect_async(url).await.expect("connect failed");
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    /// Connect and consume the initial `#welcome` notification
    async fn join(addr: SocketAddr, username: &str) -> Self {
        let mut client = Self::connect(addr, username).await;
        client.expect_switched("#welcome").await;
        client
    }

    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("send failed");
    }

    async fn command(&mut self, kind: &str, data: &str) {
        self.send(json!({"type": kind, "data": data})).await;
    }

    /// Next server message, unpacking envelopes
    async fn next_message(&mut self) -> Value {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return message;
            }

            let frame = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let envelope: Value = serde_json::from_str(&text).expect("invalid envelope");
                    let messages = envelope["messages"].as_array().expect("missing messages");
                    assert!(!messages.is_empty(), "empty envelope");
                    self.pending.extend(messages.iter().cloned());
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended unexpectedly: {:?}", other),
            }
        }
    }

    /// Skip messages until one matches
    async fn expect(&mut self, matches: impl Fn(&Value) -> bool) -> Value {
        loop {
            let message = self.next_message().await;
            if matches(&message) {
                return message;
            }
        }
    }

    async fn expect_switched(&mut self, channel: &str) {
        let message = self.next_message().await;
        assert_eq!(message["type"], "switchedChannel", "got {}", message);
        assert_eq!(message["channel"], channel);
    }

    async fn expect_server_message(&mut self, text: &str) {
        let message = self.next_message().await;
        assert_eq!(message["type"], "serverMessage", "got {}", message);
        assert_eq!(message["message"], text);
    }

    async fn expect_user_message(&mut self, sender: &str, text: &str) {
        let message = self.expect(|m| m["type"] == "userMessage").await;
        assert_eq!(message["sender"], sender);
        assert_eq!(message["message"], text);
        assert!(message["timestamp"].as_i64().unwrap() > 0);
    }
}

async fn start_server() -> SocketAddr {
    start_server_with(ServerConfig::default()).await
}

async fn start_server_with(config: ServerConfig) -> SocketAddr {
    start_server_with_registry(config).await.0
}

async fn start_server_with_registry(config: ServerConfig) -> (SocketAddr, Arc<Registry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Registry::new(config);
    tokio::spawn(serve(listener, Arc::clone(&registry)));
    (addr, registry)
}

/// Poll until `username` is (or is no longer) in the registry
async fn wait_for_user(registry: &Registry, username: &str, online: bool) -> bool {
    for _ in 0..250 {
        if registry.get_user(username).await.is_some() == online {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_multi_channel_broadcast() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    alice.command("switchMultiChannel", "general").await;
    alice.expect_switched("#general").await;

    let mut bob = TestClient::join(addr, "bob").await;
    bob.command("switchMultiChannel", "general").await;
    bob.expect_switched("#general").await;

    bob.command("sendMessage", "hi").await;
    bob.expect_user_message("bob", "hi").await;
    alice.expect_user_message("bob", "hi").await;
}

#[tokio::test]
async fn test_messages_stay_in_their_channel() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    bob.command("switchMultiChannel", "random").await;
    bob.expect_switched("#random").await;

    alice.command("sendMessage", "welcome only").await;
    alice.expect_user_message("alice", "welcome only").await;

    bob.command("sendMessage", "random only").await;
    // The first user message bob sees must be his own, not alice's
    bob.expect_user_message("bob", "random only").await;
}

#[tokio::test]
async fn test_direct_channel_to_offline_user() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    alice.command("switchDirectChannel", "Z").await;
    alice.expect_server_message("User Z does not exist").await;

    // Still in the welcome channel
    alice.command("sendMessage", "still here").await;
    alice.expect_user_message("alice", "still here").await;
}

#[tokio::test]
async fn test_direct_channel_between_two_users() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    let mut carol = TestClient::join(addr, "carol").await;

    alice.command("switchDirectChannel", "BOB").await;
    alice.expect_switched("@bob").await;
    bob.command("switchDirectChannel", "alice").await;
    bob.expect_switched("@alice").await;

    alice.command("sendMessage", "psst").await;
    bob.expect_user_message("alice", "psst").await;
    alice.expect_user_message("alice", "psst").await;

    // Carol is still in welcome and must not see the direct conversation
    carol.command("sendMessage", "anyone?").await;
    carol.expect_user_message("carol", "anyone?").await;
}

#[tokio::test]
async fn test_peer_disconnect_closes_direct_channel() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;

    alice.command("switchDirectChannel", "bob").await;
    alice.expect_switched("@bob").await;

    bob.ws.close(None).await.unwrap();
    drop(bob);

    alice.expect_server_message("bob has disconnected").await;

    alice.command("sendMessage", "hello?").await;
    alice.expect_server_message("This channel has been closed").await;
    alice.expect_switched("#welcome").await;
}

#[tokio::test]
async fn test_switch_with_trailing_message() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    alice
        .send(json!({
            "type": "switchMultiChannel",
            "data": "general",
            "additionalData": {"message": "just arrived"}
        }))
        .await;
    alice.expect_switched("#general").await;
    alice.expect_user_message("alice", "just arrived").await;
}

#[tokio::test]
async fn test_invalid_channel_name() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    alice.command("switchMultiChannel", "not valid!").await;
    alice
        .expect_server_message(
            "Channel name can only contain alphanumeric characters, underscores and dashes",
        )
        .await;
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_keep_connection() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    alice
        .ws
        .send(Message::Text("definitely not json".to_string().into()))
        .await
        .unwrap();
    alice.command("ping", "").await;
    alice.command("dance", "").await;
    alice.expect_server_message("Unknown message type: dance").await;
}

#[tokio::test]
async fn test_duplicate_username_rejected() {
    let addr = start_server().await;

    let _alice = TestClient::join(addr, "alice").await;
    let mut imposter = TestClient::connect(addr, "ALICE").await;

    match timeout(WAIT, imposter.ws.next()).await.unwrap() {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert!(frame.reason.to_string().contains("already in use"));
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reserved_username_rejected() {
    let addr = start_server().await;

    let mut admin = TestClient::connect(addr, "admin").await;
    match timeout(WAIT, admin.ws.next()).await.unwrap() {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert!(frame.reason.to_string().contains("not allowed"));
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_anonymous_login_gets_generated_name() {
    let addr = start_server().await;

    let mut anon = TestClient::join(addr, "anonymous").await;
    anon.command("sendMessage", "who am i").await;
    let message = anon.expect(|m| m["type"] == "userMessage").await;
    assert!(message["sender"].as_str().unwrap().starts_with("Anonymous#"));
}

#[tokio::test]
async fn test_username_frees_up_after_disconnect() {
    let addr = start_server().await;

    let mut alice = TestClient::join(addr, "alice").await;
    alice.ws.close(None).await.unwrap();
    // Wait for the server to acknowledge the close
    while let Ok(Some(Ok(_))) = timeout(WAIT, alice.ws.next()).await {}
    drop(alice);

    let mut again = None;
    for _ in 0..50 {
        let mut client = TestClient::connect(addr, "alice").await;
        let first = timeout(WAIT, client.ws.next()).await.unwrap();
        if let Some(Ok(Message::Text(text))) = first {
            let envelope: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(envelope["messages"][0]["channel"], "#welcome");
            again = Some(client);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(again.is_some(), "username was never released");
}

#[tokio::test]
async fn test_wrong_path_refused() {
    let addr = start_server().await;
    let result = connect_async(format!("ws://{}/elsewhere?username=alice", addr)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_origin_allow_list() {
    let config = ServerConfig {
        allowed_origins: vec!["http://localhost:5173".to_string()],
        ..ServerConfig::default()
    };
    let addr = start_server_with(config).await;

    let mut request = format!("ws://{}/ws?username=alice", addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://evil.example".parse().unwrap());
    assert!(connect_async(request).await.is_err());

    let mut request = format!("ws://{}/ws?username=alice", addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://localhost:5173".parse().unwrap());
    assert!(connect_async(request).await.is_ok());
}

#[tokio::test]
async fn test_slow_consumer_disconnected() {
    let config = ServerConfig {
        outbound_capacity: 2,
        write_wait: Duration::from_millis(500),
        max_message_size: 64 * 1024,
        ..ServerConfig::default()
    };
    let (addr, registry) = start_server_with_registry(config).await;

    // Never reads, so its socket buffers and outbound queue fill up
    let _slowpoke = TestClient::connect(addr, "slowpoke").await;
    assert!(wait_for_user(&registry, "slowpoke", true).await);
    let mut fasty = TestClient::join(addr, "fasty").await;

    let payload = "x".repeat(32 * 1024);
    let mut evicted = false;
    for _ in 0..2000 {
        fasty.command("sendMessage", &payload).await;
        fasty.expect_user_message("fasty", &payload).await;
        if registry.get_user("slowpoke").await.is_none() {
            evicted = true;
            break;
        }
    }
    assert!(evicted || wait_for_user(&registry, "slowpoke", false).await);

    // The rest of the channel keeps working
    fasty.command("sendMessage", "still here").await;
    fasty.expect_user_message("fasty", "still here").await;
    assert!(registry.get_user("fasty").await.is_some());
}

#[tokio::test]
async fn test_silent_connection_times_out() {
    let config = ServerConfig {
        pong_wait: Duration::from_secs(1),
        ..ServerConfig::default()
    };
    let (addr, registry) = start_server_with_registry(config).await;

    // Never reads, so the server's pings go unanswered
    let _quiet = TestClient::connect(addr, "quiet").await;
    assert!(wait_for_user(&registry, "quiet", true).await);

    assert!(wait_for_user(&registry, "quiet", false).await);
}
