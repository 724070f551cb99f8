use super::*;
use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    routing::get,
    Router,
};
use serde_json::json;
use shared::protocol::TOPIC_MESSAGES;
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct WsServerState {
    captured_tx: mpsc::UnboundedSender<String>,
    outbound_tx: broadcast::Sender<String>,
}

async fn ws_handler(
    State(state): State<WsServerState>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsServerState) {
    let mut outbound = state.outbound_tx.subscribe();
    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(AxumWsMessage::Text(text))) => {
                        let _ = state.captured_tx.send(text);
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
            push = outbound.recv() => {
                let Ok(text) = push else { break };
                if socket.send(AxumWsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn serve_ws_app(
    listener: TcpListener,
) -> (mpsc::UnboundedReceiver<String>, broadcast::Sender<String>) {
    let (captured_tx, captured_rx) = mpsc::unbounded_channel();
    let (outbound_tx, _) = broadcast::channel(64);
    let state = WsServerState {
        captured_tx,
        outbound_tx: outbound_tx.clone(),
    };
    let app = Router::new()
        .route("/ws/websocket", get(ws_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (captured_rx, outbound_tx)
}

async fn spawn_socket_server() -> (
    String,
    mpsc::UnboundedReceiver<String>,
    broadcast::Sender<String>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (captured_rx, outbound_tx) = serve_ws_app(listener);
    (format!("http://{addr}"), captured_rx, outbound_tx)
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let text = timeout(WAIT, rx.recv())
        .await
        .expect("frame within deadline")
        .expect("server channel open");
    serde_json::from_str(&text).expect("json frame")
}

async fn wait_for_subscriptions(rx: &mut mpsc::UnboundedReceiver<String>) {
    for expected in ALL_TOPICS {
        let frame = next_frame(rx).await;
        assert_eq!(frame["subscribe"], expected);
    }
}

async fn set_identity(socket: &ChatSocket, user_id: &str) {
    let mut guard = socket.inner.lock().await;
    guard.identity = Some(Identity {
        user_id: user_id.to_string(),
        token: "token".to_string(),
    });
}

#[test]
fn backoff_doubles_per_attempt_and_caps_at_thirty_seconds() {
    let config = SocketConfig::new("http://localhost");
    assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
    assert_eq!(config.backoff_delay(2), Duration::from_secs(4));
    assert_eq!(config.backoff_delay(4), Duration::from_secs(16));
    assert_eq!(config.backoff_delay(5), Duration::from_secs(30));
    assert_eq!(config.backoff_delay(6), Duration::from_secs(30));
    assert_eq!(config.backoff_delay(50), Duration::from_secs(30));
}

#[test]
fn sanitize_trims_and_collapses_newline_runs() {
    assert_eq!(sanitize_content("  hello  "), "hello");
    assert_eq!(sanitize_content("a\n\nb"), "a\n\nb");
    assert_eq!(sanitize_content("a\n\n\n\n\nb"), "a\n\nb");
    assert_eq!(sanitize_content("\n\n\n"), "");
}

#[test]
fn socket_url_rewrites_scheme_and_encodes_user() {
    assert_eq!(
        socket_url("https://chat.example.com/", "user one"),
        "wss://chat.example.com/ws/websocket?userId=user+one"
    );
    assert_eq!(
        socket_url("http://127.0.0.1:9000", "u1"),
        "ws://127.0.0.1:9000/ws/websocket?userId=u1"
    );
}

#[tokio::test]
async fn prepare_outbound_requires_an_identity() {
    let socket = ChatSocket::new(SocketConfig::new("http://localhost"));
    let result = socket.prepare_outbound("u2", "hello", MessageKind::Text).await;
    assert_eq!(result, Err(SendError::NotReady));
}

#[tokio::test]
async fn prepare_outbound_rejects_whitespace_only_content() {
    let socket = ChatSocket::new(SocketConfig::new("http://localhost"));
    set_identity(&socket, "u1").await;
    let result = socket
        .prepare_outbound("u2", "   \n\n  ", MessageKind::Text)
        .await;
    assert_eq!(result, Err(SendError::EmptyContent));
}

#[tokio::test]
async fn prepare_outbound_builds_a_wire_ready_message() {
    let socket = ChatSocket::new(SocketConfig::new("http://localhost"));
    set_identity(&socket, "u1").await;

    let message = socket
        .prepare_outbound("u2", "  hi there ", MessageKind::Text)
        .await
        .expect("prepare");

    assert!(message.message_id.starts_with("id-"));
    assert_eq!(message.message_id.len(), "id-".len() + 7);
    assert_eq!(message.chat_id.as_deref(), Some("u1_u2"));
    assert_eq!(message.sender_id, "u1");
    assert_eq!(message.recipient_id.as_deref(), Some("u2"));
    assert_eq!(message.content, "hi there");
    assert_eq!(message.status, MessageStatus::Sent);
}

#[tokio::test]
async fn offline_queue_drops_oldest_beyond_capacity() {
    let mut config = SocketConfig::new("http://localhost");
    config.outbound_queue_capacity = 2;
    let socket = ChatSocket::new(config);
    set_identity(&socket, "u1").await;

    let mut ids = Vec::new();
    for text in ["one", "two", "three"] {
        let message = socket
            .prepare_outbound("u2", text, MessageKind::Text)
            .await
            .expect("prepare");
        ids.push(message.message_id.clone());
        let sent_now = socket.send_prepared(&message).await;
        assert!(!sent_now);
    }

    let guard = socket.inner.lock().await;
    let queued: Vec<_> = guard.queue.iter().map(|m| m.message_id.clone()).collect();
    assert_eq!(queued, ids[1..]);
}

#[tokio::test]
async fn disconnect_clears_identity_and_queued_messages() {
    let socket = ChatSocket::new(SocketConfig::new("http://localhost"));
    set_identity(&socket, "u1").await;
    let message = socket
        .prepare_outbound("u2", "bye", MessageKind::Text)
        .await
        .expect("prepare");
    socket.send_prepared(&message).await;
    assert_eq!(socket.queued_message_count().await, 1);

    socket.disconnect().await;

    assert_eq!(socket.queued_message_count().await, 0);
    let result = socket.prepare_outbound("u2", "x", MessageKind::Text).await;
    assert_eq!(result, Err(SendError::NotReady));
}

#[tokio::test]
async fn connect_for_the_same_user_is_a_noop_while_active() {
    let socket = ChatSocket::new(SocketConfig::new("http://localhost"));
    {
        let mut guard = socket.inner.lock().await;
        guard.identity = Some(Identity {
            user_id: "u1".to_string(),
            token: "token".to_string(),
        });
        guard.conn = ConnState::Connected;
        guard.session = 5;
    }

    socket.connect("u1", "token").await;

    let guard = socket.inner.lock().await;
    assert_eq!(guard.session, 5);
    assert_eq!(guard.conn, ConnState::Connected);
}

#[tokio::test]
async fn connect_subscribes_all_topics_and_flushes_queued_messages() {
    let (server_url, mut captured_rx, _outbound_tx) = spawn_socket_server().await;
    let socket = ChatSocket::new(SocketConfig::new(server_url));
    set_identity(&socket, "u1").await;

    let queued = socket
        .prepare_outbound("u2", "written while offline", MessageKind::Text)
        .await
        .expect("prepare");
    socket.send_prepared(&queued).await;

    socket.connect("u1", "token").await;

    wait_for_subscriptions(&mut captured_rx).await;

    let frame = next_frame(&mut captured_rx).await;
    assert_eq!(frame["destination"], DEST_SEND);
    assert_eq!(frame["payload"]["messageId"], queued.message_id);
    assert_eq!(socket.queued_message_count().await, 0);

    socket.disconnect().await;
}

#[tokio::test]
async fn successful_reconnect_resets_the_backoff_counter() {
    // Reserve a port, then release it so the first dials fail.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut config = SocketConfig::new(format!("http://{addr}"));
    config.base_backoff = Duration::from_millis(20);
    let socket = ChatSocket::new(config);
    socket.connect("u1", "token").await;

    let mut dial_failed = false;
    for _ in 0..200 {
        if socket.inner.lock().await.reconnect_attempts > 0 {
            dial_failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(dial_failed, "expected at least one failed dial");

    // Bring the server up on the same port; the next attempt succeeds.
    let listener = TcpListener::bind(addr).await.expect("rebind");
    let (mut captured_rx, _outbound_tx) = serve_ws_app(listener);
    wait_for_subscriptions(&mut captured_rx).await;

    {
        let guard = socket.inner.lock().await;
        assert_eq!(guard.conn, ConnState::Connected);
        assert_eq!(guard.reconnect_attempts, 0);
        assert_eq!(guard.tls_failures, 0);
    }

    socket.disconnect().await;
}

#[tokio::test]
async fn tls_failures_below_the_budget_keep_the_identity() {
    let socket = ChatSocket::new(SocketConfig::new("https://localhost"));
    set_identity(&socket, "u1").await;

    let fatal = socket
        .record_tls_failure(0, &WsError::ConnectionClosed)
        .await;

    assert!(!fatal);
    let guard = socket.inner.lock().await;
    assert_eq!(guard.tls_failures, 1);
    assert!(guard.identity.is_some());
}

#[tokio::test]
async fn exhausting_the_tls_budget_is_fatal_and_clears_the_identity() {
    let socket = ChatSocket::new(SocketConfig::new("https://localhost"));
    set_identity(&socket, "u1").await;
    {
        let mut guard = socket.inner.lock().await;
        guard.tls_failures = 2;
        guard.conn = ConnState::Connecting;
    }
    let mut events = socket.subscribe_events();

    let fatal = socket
        .record_tls_failure(0, &WsError::ConnectionClosed)
        .await;
    assert!(fatal);

    let event = timeout(WAIT, events.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open");
    let SocketEvent::Fatal(err) = event else {
        panic!("expected fatal event, got {event:?}");
    };
    assert_eq!(err.code, "TLS_HANDSHAKE_FAILED");

    let event = timeout(WAIT, events.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open");
    assert!(matches!(
        event,
        SocketEvent::StateChanged(ConnState::Disconnected)
    ));

    let guard = socket.inner.lock().await;
    assert!(guard.identity.is_none());
    assert_eq!(guard.conn, ConnState::Disconnected);
}

#[tokio::test]
async fn inbound_message_is_decoded_and_acknowledged_as_delivered() {
    let (server_url, mut captured_rx, outbound_tx) = spawn_socket_server().await;
    let socket = ChatSocket::new(SocketConfig::new(server_url));
    let mut events = socket.subscribe_events();

    socket.connect("u1", "token").await;
    wait_for_subscriptions(&mut captured_rx).await;

    let inbound = json!({
        "topic": TOPIC_MESSAGES,
        "payload": {
            "messageId": "id-remote1",
            "chatId": "u1_u2",
            "senderId": "u2",
            "recipientId": "u1",
            "content": "hello",
            "timestamp": "2025-01-01T10:00:00.000Z",
            "status": "SENT",
            "type": "TEXT"
        }
    });
    outbound_tx.send(inbound.to_string()).expect("push frame");

    let message = loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open");
        if let SocketEvent::Event(ChatEvent::Message(message)) = event {
            break message;
        }
    };
    assert_eq!(message.message_id, "id-remote1");
    assert_eq!(message.sender_id, "u2");

    let ack = next_frame(&mut captured_rx).await;
    assert_eq!(ack["destination"], DEST_DELIVERED);
    assert_eq!(ack["payload"]["messageId"], "id-remote1");
    assert_eq!(ack["payload"]["senderId"], "u2");

    socket.disconnect().await;
}

#[tokio::test]
async fn unknown_topics_surface_as_unknown_events() {
    let (server_url, mut captured_rx, outbound_tx) = spawn_socket_server().await;
    let socket = ChatSocket::new(SocketConfig::new(server_url));
    let mut events = socket.subscribe_events();

    socket.connect("u1", "token").await;
    wait_for_subscriptions(&mut captured_rx).await;

    let inbound = json!({ "topic": "/user/queue/reactions", "payload": { "emoji": "+1" } });
    outbound_tx.send(inbound.to_string()).expect("push frame");

    let topic = loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open");
        if let SocketEvent::Event(ChatEvent::Unknown { topic }) = event {
            break topic;
        }
    };
    assert_eq!(topic, "/user/queue/reactions");

    socket.disconnect().await;
}
