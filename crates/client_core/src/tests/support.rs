#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration as StdDuration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    routing::any,
    Router,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelEvent, ClientCommand, ConversationSummary, CounterpartProfile, MessagePage,
        MessagePayload,
    },
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex, Notify},
};

use crate::{config::ClientConfig, rest::ConversationApi, scroll::Viewport, scroll::ViewportMetrics};

#[derive(Clone)]
struct PushServerState {
    commands: mpsc::UnboundedSender<ClientCommand>,
    pushes: broadcast::Sender<ChannelEvent>,
    kill: broadcast::Sender<()>,
    reject_auth: bool,
}

/// In-process push-channel server. Commands the client sends come out of
/// `commands`; events sent on `pushes` go down every open socket; `kill`
/// drops all open sockets without touching the listener.
pub struct PushServer {
    pub server_url: String,
    pub commands: mpsc::UnboundedReceiver<ClientCommand>,
    pub pushes: broadcast::Sender<ChannelEvent>,
    pub kill: broadcast::Sender<()>,
}

async fn handle_socket(mut socket: WebSocket, state: PushServerState) {
    let mut pushes = state.pushes.subscribe();
    let mut kill = state.kill.subscribe();
    loop {
        tokio::select! {
            frame = socket.recv() => {
                let Some(Ok(frame)) = frame else { break };
                let AxumWsMessage::Text(text) = frame else { continue };
                let Ok(command) = serde_json::from_str::<ClientCommand>(&text) else { continue };
                if matches!(command, ClientCommand::Authenticate { .. }) {
                    let reply = if state.reject_auth {
                        ChannelEvent::AuthRejected {
                            error: ApiError::new(ErrorCode::Unauthorized, "bad token"),
                        }
                    } else {
                        ChannelEvent::AuthAck {
                            user_id: UserId::new("user-me"),
                        }
                    };
                    let encoded = serde_json::to_string(&reply).expect("encode reply");
                    if socket.send(AxumWsMessage::Text(encoded)).await.is_err() {
                        break;
                    }
                }
                let _ = state.commands.send(command);
            }
            push = pushes.recv() => {
                let Ok(event) = push else { continue };
                let encoded = serde_json::to_string(&event).expect("encode push");
                if socket.send(AxumWsMessage::Text(encoded)).await.is_err() {
                    break;
                }
            }
            _ = kill.recv() => break,
        }
    }
}

async fn ws_upgrade(
    State(state): State<PushServerState>,
    upgrade: WebSocketUpgrade,
) -> axum::response::Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

pub async fn spawn_push_server(reject_auth: bool) -> PushServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (pushes, _) = broadcast::channel(64);
    let (kill, _) = broadcast::channel(4);
    let state = PushServerState {
        commands: commands_tx,
        pushes: pushes.clone(),
        kill: kill.clone(),
        reject_auth,
    };
    let app = Router::new().route("/ws", any(ws_upgrade)).with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    PushServer {
        server_url: format!("http://{addr}"),
        commands: commands_rx,
        pushes,
        kill,
    }
}

pub async fn next_command(server: &mut PushServer) -> ClientCommand {
    tokio::time::timeout(StdDuration::from_secs(2), server.commands.recv())
        .await
        .expect("timed out waiting for command")
        .expect("command channel closed")
}

pub fn test_config(server_url: impl Into<String>) -> ClientConfig {
    ClientConfig {
        server_url: server_url.into(),
        connect_timeout: StdDuration::from_secs(2),
        reconnect_backoff_base: StdDuration::from_millis(20),
        reconnect_backoff_cap: StdDuration::from_millis(100),
        typing_expiry: StdDuration::from_millis(200),
        typing_idle_stop: StdDuration::from_millis(80),
        page_size: 20,
        near_bottom_threshold: 48.0,
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("epoch")
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    epoch() + Duration::seconds(seconds)
}

pub fn payload(
    conversation_id: &ConversationId,
    sender_id: &UserId,
    message_id: &str,
    body: &str,
    seconds: i64,
) -> MessagePayload {
    MessagePayload {
        message_id: MessageId::new(message_id),
        conversation_id: conversation_id.clone(),
        sender_id: sender_id.clone(),
        body: body.to_string(),
        kind: Default::default(),
        parent_id: None,
        sent_at: at(seconds),
        correlation_id: None,
    }
}

pub fn summary(
    conversation_id: &ConversationId,
    counterpart: &UserId,
    unread_count: u32,
    seconds: i64,
) -> ConversationSummary {
    ConversationSummary {
        conversation_id: conversation_id.clone(),
        counterpart: CounterpartProfile {
            user_id: counterpart.clone(),
            name: counterpart.as_str().to_string(),
            avatar_url: None,
            online: false,
        },
        last_message: None,
        unread_count,
        last_activity_at: at(seconds),
    }
}

#[derive(Default)]
struct FakeApiState {
    conversations: Vec<ConversationSummary>,
    /// Full per-conversation history, oldest first.
    histories: HashMap<ConversationId, Vec<MessagePayload>>,
    fail_next_list_messages: bool,
    list_messages_calls: u32,
    fetch_conversation_calls: u32,
    marked_read: Vec<ConversationId>,
    /// When present, `list_messages` blocks on it before answering.
    gate: Option<Arc<Notify>>,
}

/// In-memory stand-in for the REST backend.
pub struct FakeConversationApi {
    inner: Mutex<FakeApiState>,
}

impl FakeConversationApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeApiState::default()),
        })
    }

    pub async fn set_conversations(&self, conversations: Vec<ConversationSummary>) {
        self.inner.lock().await.conversations = conversations;
    }

    /// Installs the full history for a conversation, oldest first.
    pub async fn set_history(&self, conversation_id: &ConversationId, history: Vec<MessagePayload>) {
        self.inner
            .lock()
            .await
            .histories
            .insert(conversation_id.clone(), history);
    }

    pub async fn fail_next_list_messages(&self) {
        self.inner.lock().await.fail_next_list_messages = true;
    }

    /// Makes every `list_messages` call wait for one permit on the returned
    /// notify, so tests can hold a fetch in flight.
    pub async fn gate_list_messages(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner.lock().await.gate = Some(Arc::clone(&gate));
        gate
    }

    pub async fn list_messages_calls(&self) -> u32 {
        self.inner.lock().await.list_messages_calls
    }

    pub async fn fetch_conversation_calls(&self) -> u32 {
        self.inner.lock().await.fetch_conversation_calls
    }

    pub async fn marked_read(&self) -> Vec<ConversationId> {
        self.inner.lock().await.marked_read.clone()
    }
}

#[async_trait]
impl ConversationApi for FakeConversationApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.inner.lock().await.conversations.clone())
    }

    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary> {
        let mut guard = self.inner.lock().await;
        guard.fetch_conversation_calls += 1;
        guard
            .conversations
            .iter()
            .find(|c| &c.conversation_id == conversation_id)
            .cloned()
            .ok_or_else(|| anyhow!("no conversation {conversation_id}"))
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<MessagePage> {
        let gate = {
            let mut guard = self.inner.lock().await;
            guard.list_messages_calls += 1;
            if guard.fail_next_list_messages {
                guard.fail_next_list_messages = false;
                return Err(anyhow!("history backend unavailable"));
            }
            guard.gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let guard = self.inner.lock().await;
        let history = guard
            .histories
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        let cutoff = match before {
            Some(before) => history
                .iter()
                .position(|m| &m.message_id == before)
                .unwrap_or(0),
            None => history.len(),
        };
        let start = cutoff.saturating_sub(limit as usize);
        let mut messages: Vec<MessagePayload> = history[start..cutoff].to_vec();
        // Pages go out newest-first.
        messages.reverse();
        Ok(MessagePage {
            messages,
            has_more: start > 0,
        })
    }

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()> {
        self.inner
            .lock()
            .await
            .marked_read
            .push(conversation_id.clone());
        Ok(())
    }
}

struct FakeViewportState {
    metrics: ViewportMetrics,
    /// Content heights applied by successive `layout_settled` calls.
    settled_heights: VecDeque<f64>,
    offsets_written: Vec<f64>,
}

/// Scriptable viewport: tests queue the content heights that each layout
/// pass will observe and inspect the scroll writes afterwards.
pub struct FakeViewport {
    inner: Mutex<FakeViewportState>,
}

impl FakeViewport {
    pub fn new(metrics: ViewportMetrics) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeViewportState {
                metrics,
                settled_heights: VecDeque::new(),
                offsets_written: Vec::new(),
            }),
        })
    }

    pub async fn queue_settled_height(&self, content_height: f64) {
        self.inner
            .lock()
            .await
            .settled_heights
            .push_back(content_height);
    }

    pub async fn set_metrics(&self, metrics: ViewportMetrics) {
        self.inner.lock().await.metrics = metrics;
    }

    pub async fn offsets_written(&self) -> Vec<f64> {
        self.inner.lock().await.offsets_written.clone()
    }
}

#[async_trait]
impl Viewport for FakeViewport {
    async fn metrics(&self) -> ViewportMetrics {
        self.inner.lock().await.metrics
    }

    async fn set_scroll_offset(&self, offset: f64) {
        let mut guard = self.inner.lock().await;
        guard.metrics.scroll_offset = offset;
        guard.offsets_written.push(offset);
    }

    async fn layout_settled(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(content_height) = guard.settled_heights.pop_front() {
            guard.metrics.content_height = content_height;
        }
    }
}
