pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod messages;
pub mod presence;
pub mod rest;
pub mod scroll;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use shared::{
    domain::{ConversationId, MessageId, MessageKind},
    protocol::{ChannelEvent, ConversationSummary},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use config::{load_config, ClientConfig};
pub use connection::{ChannelConnection, ClientEvent, ConnectionState};
pub use directory::ConversationDirectory;
pub use error::{ChannelError, PaginationError, SendError};
pub use messages::{ChatMessage, DeliveryState, LoadOutcome, MessageStream, StreamEvent};
pub use presence::PresenceTracker;
pub use rest::{ConversationApi, HttpConversationApi, MissingConversationApi};
pub use scroll::{MissingViewport, ScrollAnchorController, Viewport, ViewportMetrics};

/// One user's live conversation session: the push channel, presence, the
/// conversation directory, per-conversation message streams, and scroll
/// anchoring, wired together behind a single facade.
///
/// Construction is explicit; callers own the instance and its lifetime.
pub struct ChatSession {
    connection: Arc<ChannelConnection>,
    presence: Arc<PresenceTracker>,
    directory: Arc<ConversationDirectory>,
    messages: Arc<MessageStream>,
    scroll: Arc<ScrollAnchorController>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(
        config: ClientConfig,
        api: Arc<dyn ConversationApi>,
        viewport: Arc<dyn Viewport>,
    ) -> Arc<Self> {
        let connection = ChannelConnection::new(config.clone());
        let presence = PresenceTracker::new(
            Arc::clone(&connection),
            config.typing_expiry,
            config.typing_idle_stop,
        );
        let directory = ConversationDirectory::new(Arc::clone(&api));
        let messages = MessageStream::new(api, Arc::clone(&connection), config.page_size);
        let scroll = ScrollAnchorController::new(
            Arc::clone(&messages),
            viewport,
            config.near_bottom_threshold,
        );

        let session = Arc::new(Self {
            connection,
            presence,
            directory,
            messages,
            scroll,
            dispatch_task: Mutex::new(None),
        });
        session.spawn_dispatch();
        session
    }

    /// Connects the push channel and loads the conversation list.
    pub async fn start(&self, token: &str) -> Result<()> {
        self.connection.connect(token).await?;
        self.directory.refresh().await?;
        Ok(())
    }

    /// Opens a conversation: joins its room, loads the newest page, and
    /// marks it read when it had unread messages.
    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.scroll
            .set_active_conversation(Some(conversation_id.clone()))
            .await;
        self.directory
            .set_active(Some(conversation_id.clone()))
            .await;
        self.connection.join_conversation(conversation_id).await;

        self.messages.load_initial(conversation_id).await?;

        if self.directory.unread_count(conversation_id).await > 0 {
            self.messages.mark_as_read(conversation_id).await?;
            self.directory.clear_unread(conversation_id).await;
        }
        Ok(())
    }

    pub async fn close_conversation(&self, conversation_id: &ConversationId) {
        self.connection.leave_conversation(conversation_id).await;
        self.presence.stop_local_typing(conversation_id).await;
        self.directory.set_active(None).await;
        self.scroll.set_active_conversation(None).await;
    }

    /// Loads one older history page, keeping the viewport anchored.
    pub async fn load_older(&self) -> Result<LoadOutcome, PaginationError> {
        self.scroll.paginate().await
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        body: impl Into<String>,
        kind: MessageKind,
        parent_id: Option<MessageId>,
    ) -> Result<MessageId, SendError> {
        // Sending implies the composer was cleared.
        self.presence.stop_local_typing(conversation_id).await;
        self.messages
            .send(conversation_id, body, kind, parent_id)
            .await
    }

    pub async fn retry_send(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), SendError> {
        self.messages.retry_send(conversation_id, message_id).await
    }

    /// The user scrolled to the bottom of the active conversation; catches
    /// up the read state.
    pub async fn scrolled_to_bottom(&self) -> Result<()> {
        self.scroll.scroll_to_bottom().await;
        if let Some(conversation_id) = self.directory.active().await {
            if self.directory.unread_count(&conversation_id).await > 0 {
                self.messages.mark_as_read(&conversation_id).await?;
                self.directory.clear_unread(&conversation_id).await;
            }
        }
        Ok(())
    }

    pub async fn note_user_scroll(&self) {
        self.scroll.note_user_scroll().await;
    }

    pub async fn notice_typing(&self, conversation_id: &ConversationId) {
        self.presence.notice_local_typing(conversation_id).await;
    }

    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.scroll.shutdown().await;
        let task = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        info!("session: shut down");
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.directory.snapshot().await
    }

    pub async fn window(&self, conversation_id: &ConversationId) -> Vec<ChatMessage> {
        self.messages.window(conversation_id).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ClientEvent> {
        self.connection.subscribe_events()
    }

    pub fn subscribe_stream_events(&self) -> tokio::sync::broadcast::Receiver<StreamEvent> {
        self.messages.subscribe_events()
    }

    pub fn connection(&self) -> &Arc<ChannelConnection> {
        &self.connection
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn directory(&self) -> &Arc<ConversationDirectory> {
        &self.directory
    }

    pub fn messages(&self) -> &Arc<MessageStream> {
        &self.messages
    }

    pub fn scroll(&self) -> &Arc<ScrollAnchorController> {
        &self.scroll
    }

    /// Single dispatch point for push events. Every event variant is routed
    /// here exactly once; components never subscribe to the bus themselves.
    fn spawn_dispatch(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let mut events = self.connection.subscribe_events();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Channel(event)) => session.dispatch(event).await,
                    Ok(ClientEvent::StateChanged(state)) => {
                        debug!(?state, "session: connection state changed");
                        if matches!(
                            state,
                            ConnectionState::Error | ConnectionState::Disconnected
                        ) {
                            // Confirmations for in-flight sends cannot
                            // arrive on a dead channel. Echoes that beat
                            // the loss are already dispatched; this bus is
                            // consumed in order.
                            session.messages.fail_inflight_sends().await;
                        }
                    }
                    Ok(ClientEvent::Error(message)) => {
                        warn!("session: channel error: {message}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: dispatch lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self
            .dispatch_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
    }

    async fn dispatch(&self, event: ChannelEvent) {
        match &event {
            ChannelEvent::AuthAck { user_id } => {
                self.directory.set_local_user(user_id.clone()).await;
                self.messages.set_local_user(user_id.clone()).await;
            }
            ChannelEvent::AuthRejected { error } => {
                warn!("session: authentication rejected: {error}");
            }
            ChannelEvent::NewMessage { message } => {
                self.messages.apply_incoming(message).await;
                self.directory.apply_new_message(message).await;
            }
            ChannelEvent::TypingStarted { .. }
            | ChannelEvent::TypingStopped { .. }
            | ChannelEvent::UserOnline { .. }
            | ChannelEvent::UserOffline { .. }
            | ChannelEvent::PresenceUpdated { .. } => {
                self.presence.apply_event(&event).await;
            }
            ChannelEvent::MessageRead {
                conversation_id,
                user_id,
                ..
            } => {
                self.directory
                    .apply_message_read(conversation_id, user_id)
                    .await;
            }
            ChannelEvent::ConversationJoined {
                conversation_id,
                success,
                error,
            } => {
                if !*success {
                    match error {
                        Some(error) => warn!(
                            conversation_id = %conversation_id,
                            "session: room join rejected: {error}"
                        ),
                        None => warn!(
                            conversation_id = %conversation_id,
                            "session: room join rejected"
                        ),
                    }
                }
            }
            ChannelEvent::Error(error) => {
                warn!("session: server error: {error}");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
