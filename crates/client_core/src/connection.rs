use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{ChannelEvent, ClientCommand},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::{config::ClientConfig, error::ChannelError};

const EVENT_BUS_CAPACITY: usize = 1024;
const MAX_BACKOFF_EXPONENT: u32 = 16;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Everything published on the connection's event bus: decoded push events,
/// state transitions, and locally detected faults.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Channel(ChannelEvent),
    StateChanged(ConnectionState),
    Error(String),
}

struct ConnState {
    state: ConnectionState,
    auth_token: Option<String>,
    local_user_id: Option<UserId>,
    /// Rooms the caller has joined; re-joined transparently on reconnect.
    joined: HashSet<ConversationId>,
    /// Bumped on every connect/disconnect so stale reader tasks and
    /// superseded dial attempts can detect they lost the race.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<ClientCommand>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

/// The single live push-channel connection for a session.
///
/// Owns the connect/disconnect lifecycle, the auth handshake, the typed
/// event bus, and the reconnect loop. Upper layers subscribe with
/// [`ChannelConnection::subscribe_events`] and drop the receiver to
/// unsubscribe.
pub struct ChannelConnection {
    config: ClientConfig,
    inner: Mutex<ConnState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChannelConnection {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Arc::new(Self {
            config,
            inner: Mutex::new(ConnState {
                state: ConnectionState::Disconnected,
                auth_token: None,
                local_user_id: None,
                joined: HashSet::new(),
                generation: 0,
                outbound: None,
                reader_task: None,
                writer_task: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// User id confirmed by the auth handshake, if any.
    pub async fn local_user_id(&self) -> Option<UserId> {
        self.inner.lock().await.local_user_id.clone()
    }

    pub async fn joined_conversations(&self) -> Vec<ConversationId> {
        self.inner.lock().await.joined.iter().cloned().collect()
    }

    /// Connects and authenticates. Idempotent while already connected or
    /// connecting. Auth rejection fails without scheduling a retry; a
    /// transport failure schedules the backoff reconnect loop before
    /// returning the error.
    pub async fn connect(self: &Arc<Self>, token: &str) -> Result<(), ChannelError> {
        if token.trim().is_empty() {
            return Err(ChannelError::MissingToken);
        }

        let generation = {
            let mut guard = self.inner.lock().await;
            match guard.state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected | ConnectionState::Error => {}
            }
            guard.state = ConnectionState::Connecting;
            guard.auth_token = Some(token.to_string());
            guard.generation += 1;
            guard.generation
        };
        self.publish_state(ConnectionState::Connecting);

        match self.dial(generation).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let retry = !matches!(err, ChannelError::Auth(_) | ChannelError::MissingToken);
                self.fail_generation(generation, retry).await;
                Err(err)
            }
        }
    }

    /// Tears the transport down and clears all room memberships. Terminal:
    /// no reconnect follows until the caller connects again. Safe to call
    /// from any state.
    pub async fn disconnect(&self) {
        let (reader, writer) = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            guard.joined.clear();
            guard.outbound = None;
            guard.auth_token = None;
            guard.state = ConnectionState::Disconnected;
            (guard.reader_task.take(), guard.writer_task.take())
        };
        if let Some(task) = reader {
            task.abort();
        }
        if let Some(task) = writer {
            task.abort();
        }
        self.publish_state(ConnectionState::Disconnected);
    }

    /// Fire-and-forget command emission. When not connected the command is
    /// dropped and reported on the event bus, never returned as an error.
    pub async fn emit(&self, command: ClientCommand) {
        let sender = {
            let guard = self.inner.lock().await;
            match (guard.state, &guard.outbound) {
                (ConnectionState::Connected, Some(sender)) => Some(sender.clone()),
                _ => None,
            }
        };
        let Some(sender) = sender else {
            warn!(
                command = command_name(&command),
                "channel: dropping command while not connected"
            );
            let _ = self.events.send(ClientEvent::Error(format!(
                "cannot emit {} while not connected",
                command_name(&command)
            )));
            return;
        };
        if sender.send(command).is_err() {
            let _ = self
                .events
                .send(ClientEvent::Error("outbound channel closed".into()));
        }
    }

    /// Joins a conversation room. Membership is tracked locally so it
    /// survives reconnects.
    pub async fn join_conversation(&self, conversation_id: &ConversationId) {
        {
            let mut guard = self.inner.lock().await;
            guard.joined.insert(conversation_id.clone());
        }
        self.emit(ClientCommand::JoinConversation {
            conversation_id: conversation_id.clone(),
        })
        .await;
    }

    pub async fn leave_conversation(&self, conversation_id: &ConversationId) {
        {
            let mut guard = self.inner.lock().await;
            guard.joined.remove(conversation_id);
        }
        self.emit(ClientCommand::LeaveConversation {
            conversation_id: conversation_id.clone(),
        })
        .await;
    }

    async fn dial(self: &Arc<Self>, generation: u64) -> Result<(), ChannelError> {
        let token = {
            let guard = self.inner.lock().await;
            if guard.generation != generation {
                return Err(ChannelError::Transport(
                    "superseded by a newer connection attempt".into(),
                ));
            }
            guard.auth_token.clone().ok_or(ChannelError::MissingToken)?
        };
        let ws_url = push_channel_url(&self.config.server_url)?;

        let handshake = self.open_and_authenticate(&ws_url, token);
        let (writer, reader, user_id) = timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| ChannelError::ConnectTimeout(self.config.connect_timeout))??;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(pump_outbound(outbound_rx, writer));
        let reader_task = {
            let conn = Arc::clone(self);
            tokio::spawn(async move {
                conn.pump_inbound(generation, reader).await;
            })
        };

        let rejoin = {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                writer_task.abort();
                reader_task.abort();
                return Err(ChannelError::Transport(
                    "superseded by a newer connection attempt".into(),
                ));
            }
            guard.state = ConnectionState::Connected;
            guard.local_user_id = Some(user_id.clone());
            guard.outbound = Some(outbound_tx.clone());
            if let Some(task) = guard.reader_task.replace(reader_task) {
                task.abort();
            }
            if let Some(task) = guard.writer_task.replace(writer_task) {
                task.abort();
            }
            guard.joined.iter().cloned().collect::<Vec<_>>()
        };

        self.publish_state(ConnectionState::Connected);
        let _ = self
            .events
            .send(ClientEvent::Channel(ChannelEvent::AuthAck { user_id }));

        for conversation_id in rejoin {
            info!(conversation_id = %conversation_id, "channel: re-joining room after connect");
            let _ = outbound_tx.send(ClientCommand::JoinConversation { conversation_id });
        }

        Ok(())
    }

    async fn open_and_authenticate(
        &self,
        ws_url: &str,
        token: String,
    ) -> Result<(WsSink, WsSource, UserId), ChannelError> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        let frame = serde_json::to_string(&ClientCommand::Authenticate { token })
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        writer
            .send(WsMessage::Text(frame))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?;

        loop {
            let Some(frame) = reader.next().await else {
                return Err(ChannelError::Transport(
                    "channel closed during handshake".into(),
                ));
            };
            let frame = frame.map_err(|err| ChannelError::Transport(err.to_string()))?;
            let WsMessage::Text(text) = frame else {
                continue;
            };
            let event = serde_json::from_str::<ChannelEvent>(&text)
                .map_err(|err| ChannelError::Transport(format!("invalid handshake frame: {err}")))?;
            match event {
                ChannelEvent::AuthAck { user_id } => return Ok((writer, reader, user_id)),
                ChannelEvent::AuthRejected { error } => return Err(ChannelError::Auth(error)),
                ChannelEvent::Error(error) if error.is_auth() => {
                    return Err(ChannelError::Auth(error))
                }
                other => {
                    // Server pushes that raced ahead of the ack.
                    let _ = self.events.send(ClientEvent::Channel(other));
                }
            }
        }
    }

    async fn pump_inbound(self: Arc<Self>, generation: u64, mut reader: WsSource) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<ChannelEvent>(&text) {
                    Ok(event) => {
                        let _ = self.events.send(ClientEvent::Channel(event));
                    }
                    Err(err) => {
                        let _ = self
                            .events
                            .send(ClientEvent::Error(format!("invalid channel event: {err}")));
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    let _ = self
                        .events
                        .send(ClientEvent::Error(format!("channel receive failed: {err}")));
                    break;
                }
            }
        }

        {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation || guard.state == ConnectionState::Disconnected {
                return;
            }
            guard.state = ConnectionState::Error;
            guard.outbound = None;
        }
        self.publish_state(ConnectionState::Error);
        warn!("channel: transport lost, scheduling reconnect");
        self.spawn_reconnect_loop();
    }

    fn spawn_reconnect_loop(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                tokio::time::sleep(conn.backoff_delay(attempt)).await;

                let generation = {
                    let mut guard = conn.inner.lock().await;
                    match guard.state {
                        // Explicit disconnect or a concurrent recovery wins.
                        ConnectionState::Disconnected | ConnectionState::Connected => return,
                        ConnectionState::Connecting | ConnectionState::Error => {}
                    }
                    guard.state = ConnectionState::Connecting;
                    guard.generation += 1;
                    guard.generation
                };
                conn.publish_state(ConnectionState::Connecting);

                match conn.dial(generation).await {
                    Ok(()) => {
                        info!(attempt, "channel: reconnected");
                        return;
                    }
                    Err(ChannelError::Auth(error)) => {
                        conn.fail_generation(generation, false).await;
                        let _ = conn.events.send(ClientEvent::Error(format!(
                            "reconnect abandoned, authentication rejected: {error}"
                        )));
                        return;
                    }
                    Err(err) => {
                        conn.fail_generation(generation, false).await;
                        warn!(attempt, "channel: reconnect attempt failed: {err}");
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        });
    }

    async fn fail_generation(self: &Arc<Self>, generation: u64, retry: bool) {
        {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation || guard.state == ConnectionState::Disconnected {
                return;
            }
            guard.state = ConnectionState::Error;
            guard.outbound = None;
        }
        self.publish_state(ConnectionState::Error);
        if retry {
            self.spawn_reconnect_loop();
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = self
            .config
            .reconnect_backoff_base
            .saturating_mul(1u32 << attempt.min(MAX_BACKOFF_EXPONENT));
        scaled.min(self.config.reconnect_backoff_cap)
    }

    fn publish_state(&self, state: ConnectionState) {
        let _ = self.events.send(ClientEvent::StateChanged(state));
    }
}

async fn pump_outbound(mut outbound: mpsc::UnboundedReceiver<ClientCommand>, mut writer: WsSink) {
    while let Some(command) = outbound.recv().await {
        let frame = match serde_json::to_string(&command) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("channel: failed to encode outbound command: {err}");
                continue;
            }
        };
        if writer.send(WsMessage::Text(frame)).await.is_err() {
            break;
        }
    }
}

fn push_channel_url(server_url: &str) -> Result<String, ChannelError> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ChannelError::Transport(
            "server_url must start with http:// or https://".into(),
        ));
    };
    Ok(format!("{}/ws", ws_base.trim_end_matches('/')))
}

fn command_name(command: &ClientCommand) -> &'static str {
    match command {
        ClientCommand::Authenticate { .. } => "authenticate",
        ClientCommand::JoinConversation { .. } => "join:conversation",
        ClientCommand::LeaveConversation { .. } => "leave:conversation",
        ClientCommand::SendMessage { .. } => "message:send",
        ClientCommand::TypingStarted { .. } => "message:typing:start",
        ClientCommand::TypingStopped { .. } => "message:typing:stop",
        ClientCommand::MarkRead { .. } => "message:read",
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
