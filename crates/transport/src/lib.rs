//! Websocket transport for the chat sync stack.
//!
//! [`ChatSocket`] owns the connection lifecycle: it dials the server with the
//! active identity, subscribes the per-user topics, keeps the link alive with
//! heartbeats, and reconnects with exponential backoff when the link drops.
//! Messages prepared while offline land in a bounded in-memory queue and are
//! flushed oldest-first once a connection is back up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};

use shared::{
    domain::{conversation_key, iso_now, MessageKind, MessageStatus},
    error::{FatalTransportError, SendError},
    protocol::{
        AckDto, ChatEvent, InboundFrame, MessageDto, SendFrame, SubscribeFrame, TypingSendDto,
        ALL_TOPICS, DEST_DELIVERED, DEST_HEARTBEAT, DEST_READ, DEST_SEND, DEST_TYPING,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Base server URL, `http(s)://host[:port]`. Rewritten to `ws(s)://` for
    /// the socket endpoint.
    pub server_url: String,
    pub heartbeat_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Exponent cap for the backoff curve; delays stop growing past this
    /// attempt count.
    pub backoff_attempt_cap: u32,
    pub outbound_queue_capacity: usize,
    /// Consecutive TLS handshake failures tolerated before the socket gives
    /// up and reports a fatal error.
    pub max_tls_retries: u32,
}

impl SocketConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            heartbeat_interval: Duration::from_secs(30),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_attempt_cap: 6,
            outbound_queue_capacity: 100,
            max_tls_retries: 3,
        }
    }

    /// Delay before reconnect attempt number `attempts` (1-based).
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(self.backoff_attempt_cap);
        let delay = self.base_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum SocketEvent {
    StateChanged(ConnState),
    Event(ChatEvent),
    Fatal(FatalTransportError),
}

#[derive(Clone)]
struct Identity {
    user_id: String,
    #[allow(dead_code)]
    token: String,
}

struct SocketState {
    identity: Option<Identity>,
    conn: ConnState,
    /// Bumped on every connect/disconnect; stale run loops observe the
    /// mismatch and exit instead of fighting the new session.
    session: u64,
    reconnect_attempts: u32,
    tls_failures: u32,
    writer: Option<mpsc::UnboundedSender<Message>>,
    run_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    queue: VecDeque<MessageDto>,
}

pub struct ChatSocket {
    config: SocketConfig,
    inner: Mutex<SocketState>,
    events: broadcast::Sender<SocketEvent>,
}

impl ChatSocket {
    pub fn new(config: SocketConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            inner: Mutex::new(SocketState {
                identity: None,
                conn: ConnState::Disconnected,
                session: 0,
                reconnect_attempts: 0,
                tls_failures: 0,
                writer: None,
                run_task: None,
                heartbeat_task: None,
                queue: VecDeque::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnState {
        self.inner.lock().await.conn
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnState::Connected
    }

    pub async fn queued_message_count(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Adopts `user_id` as the active identity and starts the connection
    /// loop. A no-op for the same user while a session is live; a different
    /// user tears the old session down and drops the outbound queue.
    pub async fn connect(self: &Arc<Self>, user_id: &str, token: &str) {
        let session = {
            let mut guard = self.inner.lock().await;
            let same_user = guard
                .identity
                .as_ref()
                .is_some_and(|identity| identity.user_id == user_id);
            if same_user && guard.conn != ConnState::Disconnected {
                debug!(user_id, "connect: session already active");
                return;
            }
            if !same_user {
                guard.queue.clear();
            }
            if let Some(task) = guard.run_task.take() {
                task.abort();
            }
            if let Some(task) = guard.heartbeat_task.take() {
                task.abort();
            }
            guard.writer = None;
            guard.identity = Some(Identity {
                user_id: user_id.to_string(),
                token: token.to_string(),
            });
            guard.conn = ConnState::Disconnected;
            guard.reconnect_attempts = 0;
            guard.tls_failures = 0;
            guard.session += 1;
            guard.session
        };

        info!(user_id, "starting websocket session");
        let task = tokio::spawn(Arc::clone(self).run(session));
        let mut guard = self.inner.lock().await;
        if guard.session == session {
            guard.run_task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Drops the identity, closes the socket and discards queued messages.
    pub async fn disconnect(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.identity = None;
            guard.conn = ConnState::Disconnected;
            guard.session += 1;
            guard.writer = None;
            guard.queue.clear();
            if let Some(task) = guard.run_task.take() {
                task.abort();
            }
            if let Some(task) = guard.heartbeat_task.take() {
                task.abort();
            }
        }
        info!("websocket session closed");
        let _ = self
            .events
            .send(SocketEvent::StateChanged(ConnState::Disconnected));
    }

    /// Builds the wire DTO for an outbound chat message; delivery is handled
    /// separately by [`ChatSocket::send_prepared`].
    pub async fn prepare_outbound(
        &self,
        recipient_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<MessageDto, SendError> {
        let sender_id = {
            let guard = self.inner.lock().await;
            guard
                .identity
                .as_ref()
                .map(|identity| identity.user_id.clone())
                .ok_or(SendError::NotReady)?
        };

        let content = sanitize_content(content);
        if content.is_empty() {
            return Err(SendError::EmptyContent);
        }

        Ok(MessageDto {
            message_id: generate_message_id(),
            chat_id: Some(conversation_key(&sender_id, recipient_id)),
            sender_id,
            recipient_id: Some(recipient_id.to_string()),
            content,
            timestamp: iso_now(),
            status: MessageStatus::Sent,
            kind,
            metadata: None,
        })
    }

    /// Transmits immediately when connected, otherwise enqueues for the next
    /// flush (bounded, drop-oldest). Returns whether the message went out
    /// right away.
    pub async fn send_prepared(&self, message: &MessageDto) -> bool {
        let mut guard = self.inner.lock().await;
        let sent = match (&guard.conn, &guard.writer) {
            (ConnState::Connected, Some(writer)) => {
                send_frame(writer, DEST_SEND, serde_json::to_value(message).ok())
            }
            _ => false,
        };
        if !sent {
            if guard.queue.len() >= self.config.outbound_queue_capacity {
                if let Some(dropped) = guard.queue.pop_front() {
                    warn!(
                        message_id = %dropped.message_id,
                        "outbound queue full, dropping oldest message"
                    );
                }
            }
            debug!(message_id = %message.message_id, "queued message for later delivery");
            guard.queue.push_back(message.clone());
        }
        sent
    }

    pub async fn send_typing(&self, recipient_id: &str, is_typing: bool) {
        let payload = serde_json::to_value(TypingSendDto {
            recipient_id: recipient_id.to_string(),
            is_typing,
        })
        .ok();
        if !self.publish_if_connected(DEST_TYPING, payload).await {
            debug!(recipient_id, "typing indicator skipped: not connected");
        }
    }

    pub async fn send_delivered_ack(&self, message_id: &str, sender_id: &str) {
        let payload = ack_payload(message_id, sender_id);
        if !self.publish_if_connected(DEST_DELIVERED, payload).await {
            debug!(message_id, "delivered ack skipped: not connected");
        }
    }

    pub async fn send_read_ack(&self, message_id: &str, sender_id: &str) {
        let payload = ack_payload(message_id, sender_id);
        if !self.publish_if_connected(DEST_READ, payload).await {
            debug!(message_id, "read ack skipped: not connected");
        }
    }

    async fn publish_if_connected(&self, destination: &str, payload: Option<Value>) -> bool {
        let guard = self.inner.lock().await;
        match (&guard.conn, &guard.writer) {
            (ConnState::Connected, Some(writer)) => send_frame(writer, destination, payload),
            _ => false,
        }
    }

    async fn run(self: Arc<Self>, session: u64) {
        loop {
            let identity = {
                let guard = self.inner.lock().await;
                if guard.session != session {
                    return;
                }
                match &guard.identity {
                    Some(identity) => identity.clone(),
                    None => return,
                }
            };

            if !self.set_conn(session, ConnState::Connecting).await {
                return;
            }

            match self.establish(session, &identity).await {
                Ok(SessionEnd::Superseded) => return,
                Ok(SessionEnd::Closed) => {
                    info!("websocket closed by peer");
                }
                Err(err) => {
                    if is_tls_error(&err) && self.record_tls_failure(session, &err).await {
                        return;
                    }
                    warn!(error = %err, "websocket connection failed");
                }
            }

            let delay = {
                let mut guard = self.inner.lock().await;
                if guard.session != session || guard.identity.is_none() {
                    return;
                }
                guard.conn = ConnState::Disconnected;
                guard.reconnect_attempts += 1;
                self.config.backoff_delay(guard.reconnect_attempts)
            };
            let _ = self
                .events
                .send(SocketEvent::StateChanged(ConnState::Disconnected));
            info!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    async fn establish(
        self: &Arc<Self>,
        session: u64,
        identity: &Identity,
    ) -> Result<SessionEnd, WsError> {
        let url = socket_url(&self.config.server_url, &identity.user_id);
        let (stream, _) = connect_async(&url).await?;
        let (mut sink, mut reader) = stream.split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        {
            let mut guard = self.inner.lock().await;
            if guard.session != session {
                writer_task.abort();
                return Ok(SessionEnd::Superseded);
            }
            guard.conn = ConnState::Connected;
            guard.reconnect_attempts = 0;
            guard.tls_failures = 0;
            guard.writer = Some(writer_tx.clone());
        }
        info!(user_id = %identity.user_id, "websocket connected");
        let _ = self
            .events
            .send(SocketEvent::StateChanged(ConnState::Connected));

        for topic in ALL_TOPICS {
            let frame = SubscribeFrame {
                subscribe: topic.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = writer_tx.send(Message::Text(text));
            }
        }

        self.start_heartbeat(session, writer_tx.clone()).await;
        self.flush_queue().await;

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => self.dispatch_frame(&text, &writer_tx),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "websocket read failed");
                    break;
                }
            }
        }

        writer_task.abort();
        self.teardown_connection(session).await;
        Ok(SessionEnd::Closed)
    }

    // Inbound chat messages are acked as delivered before fan-out.
    fn dispatch_frame(&self, text: &str, writer: &mpsc::UnboundedSender<Message>) {
        let frame = match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "discarding unparseable socket frame");
                return;
            }
        };
        let event = match ChatEvent::decode(&frame.topic, frame.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(topic = %frame.topic, error = %err, "discarding malformed payload");
                return;
            }
        };

        if let ChatEvent::Message(message) = &event {
            send_frame(
                writer,
                DEST_DELIVERED,
                ack_payload(&message.message_id, &message.sender_id),
            );
        }
        if let ChatEvent::Unknown { topic } = &event {
            debug!(topic = %topic, "ignoring event for unknown topic");
        }
        let _ = self.events.send(SocketEvent::Event(event));
    }

    async fn start_heartbeat(self: &Arc<Self>, session: u64, writer: mpsc::UnboundedSender<Message>) {
        let interval = self.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !send_frame(&writer, DEST_HEARTBEAT, Some(Value::Null)) {
                    break;
                }
            }
        });

        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.heartbeat_task.take() {
            previous.abort();
        }
        if guard.session == session {
            guard.heartbeat_task = Some(task);
        } else {
            task.abort();
        }
    }

    // Oldest first; entries are not re-enqueued on failure. The server-side
    // sync endpoint is the safety net for messages lost mid-flush.
    async fn flush_queue(&self) {
        let mut guard = self.inner.lock().await;
        let Some(writer) = guard.writer.clone() else {
            return;
        };
        let pending = guard.queue.len();
        if pending == 0 {
            return;
        }
        info!(pending, "flushing queued messages");
        while let Some(message) = guard.queue.pop_front() {
            if !send_frame(&writer, DEST_SEND, serde_json::to_value(&message).ok()) {
                warn!(message_id = %message.message_id, "failed to flush queued message");
            }
        }
    }

    // Returns true when the failure is terminal and the run loop must stop.
    async fn record_tls_failure(&self, session: u64, err: &WsError) -> bool {
        let fatal = {
            let mut guard = self.inner.lock().await;
            if guard.session != session {
                return true;
            }
            guard.tls_failures += 1;
            warn!(
                failures = guard.tls_failures,
                error = %err,
                "tls handshake failed"
            );
            guard.tls_failures >= self.config.max_tls_retries
        };
        if !fatal {
            return false;
        }

        {
            let mut guard = self.inner.lock().await;
            guard.identity = None;
            guard.conn = ConnState::Disconnected;
            guard.writer = None;
        }
        warn!("giving up after repeated tls failures; identity cleared");
        let _ = self.events.send(SocketEvent::Fatal(
            FatalTransportError::tls_handshake(err.to_string()),
        ));
        let _ = self
            .events
            .send(SocketEvent::StateChanged(ConnState::Disconnected));
        true
    }

    async fn teardown_connection(&self, session: u64) {
        let mut guard = self.inner.lock().await;
        if guard.session != session {
            return;
        }
        guard.writer = None;
        guard.conn = ConnState::Disconnected;
        if let Some(task) = guard.heartbeat_task.take() {
            task.abort();
        }
    }

    async fn set_conn(&self, session: u64, conn: ConnState) -> bool {
        {
            let mut guard = self.inner.lock().await;
            if guard.session != session {
                return false;
            }
            guard.conn = conn;
        }
        let _ = self.events.send(SocketEvent::StateChanged(conn));
        true
    }
}

enum SessionEnd {
    Closed,
    Superseded,
}

fn send_frame(
    writer: &mpsc::UnboundedSender<Message>,
    destination: &str,
    payload: Option<Value>,
) -> bool {
    let Some(payload) = payload else {
        return false;
    };
    let frame = SendFrame {
        destination: destination.to_string(),
        payload,
    };
    match serde_json::to_string(&frame) {
        Ok(text) => writer.send(Message::Text(text)).is_ok(),
        Err(_) => false,
    }
}

fn ack_payload(message_id: &str, sender_id: &str) -> Option<Value> {
    serde_json::to_value(AckDto {
        message_id: message_id.to_string(),
        sender_id: sender_id.to_string(),
    })
    .ok()
}

fn is_tls_error(err: &WsError) -> bool {
    matches!(err, WsError::Tls(_))
}

fn generate_message_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("id-{}", &uuid[..7])
}

fn socket_url(server_url: &str, user_id: &str) -> String {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server_url.to_string()
    };
    let base = base.trim_end_matches('/');
    let encoded: String = url::form_urlencoded::byte_serialize(user_id.as_bytes()).collect();
    format!("{base}/ws/websocket?userId={encoded}")
}

// Trim the edges, collapse runs of 3+ newlines down to one blank line.
fn sanitize_content(content: &str) -> String {
    let trimmed = content.trim();
    let mut out = String::with_capacity(trimmed.len());
    let mut newline_run = 0usize;
    for ch in trimmed.chars() {
        if ch == '\n' {
            newline_run += 1;
            continue;
        }
        if newline_run > 0 {
            if newline_run >= 3 {
                out.push_str("\n\n");
            } else {
                for _ in 0..newline_run {
                    out.push('\n');
                }
            }
            newline_run = 0;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
