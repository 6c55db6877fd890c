use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageKind, UserId},
    protocol::{ClientCommand, MessagePayload},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    connection::{ChannelConnection, ConnectionState},
    error::{PaginationError, SendError},
    rest::ConversationApi,
};

const STREAM_BUS_CAPACITY: usize = 256;
/// Tolerance for matching a server echo against an optimistic entry when the
/// echo lost its correlation token.
const ECHO_MATCH_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistic entry, send not yet confirmed.
    Pending,
    Sent,
    /// Send failed; the entry stays visible and retryable.
    Failed,
}

/// Client-side view of one message in a loaded window.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub parent_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    pub correlation_id: Option<String>,
}

impl ChatMessage {
    fn from_payload(payload: &MessagePayload) -> Self {
        Self {
            id: payload.message_id.clone(),
            conversation_id: payload.conversation_id.clone(),
            sender_id: payload.sender_id.clone(),
            body: payload.body.clone(),
            kind: payload.kind,
            parent_id: payload.parent_id.clone(),
            sent_at: payload.sent_at,
            delivery: DeliveryState::Sent,
            correlation_id: payload.correlation_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    InitialLoaded {
        conversation_id: ConversationId,
        count: usize,
    },
    PageLoaded {
        conversation_id: ConversationId,
        prepended: usize,
    },
    MessageAppended {
        conversation_id: ConversationId,
        message_id: MessageId,
        at_tail: bool,
    },
    DeliveryUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        delivery: DeliveryState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { prepended: usize },
    /// Fail-fast no-op: a load was already in flight or history is
    /// exhausted.
    Skipped,
}

#[derive(Default)]
struct MessageWindow {
    /// Strictly ascending by `(sent_at, id)`, no duplicate ids.
    messages: Vec<ChatMessage>,
    has_more: bool,
}

struct StreamState {
    windows: HashMap<ConversationId, MessageWindow>,
    /// Per-conversation leases serializing pagination and mark-read.
    leases: HashMap<ConversationId, Arc<Mutex<()>>>,
    local_user_id: Option<UserId>,
}

/// Per-conversation paginated message log: initial load, backward
/// pagination, optimistic send, and merge of server-pushed messages. Sole
/// writer of message windows and delivery status.
pub struct MessageStream {
    api: Arc<dyn ConversationApi>,
    connection: Arc<ChannelConnection>,
    page_size: u32,
    inner: Mutex<StreamState>,
    events: broadcast::Sender<StreamEvent>,
}

impl MessageStream {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        connection: Arc<ChannelConnection>,
        page_size: u32,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(STREAM_BUS_CAPACITY);
        Arc::new(Self {
            api,
            connection,
            page_size,
            inner: Mutex::new(StreamState {
                windows: HashMap::new(),
                leases: HashMap::new(),
                local_user_id: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub async fn set_local_user(&self, user_id: UserId) {
        self.inner.lock().await.local_user_id = Some(user_id);
    }

    pub async fn window(&self, conversation_id: &ConversationId) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .await
            .windows
            .get(conversation_id)
            .map(|w| w.messages.clone())
            .unwrap_or_default()
    }

    pub async fn window_len(&self, conversation_id: &ConversationId) -> usize {
        self.inner
            .lock()
            .await
            .windows
            .get(conversation_id)
            .map(|w| w.messages.len())
            .unwrap_or(0)
    }

    pub async fn has_more(&self, conversation_id: &ConversationId) -> bool {
        self.inner
            .lock()
            .await
            .windows
            .get(conversation_id)
            .map(|w| w.has_more)
            .unwrap_or(false)
    }

    /// Fetches the most recent page and replaces any existing window for the
    /// conversation.
    pub async fn load_initial(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<usize, PaginationError> {
        let lease = self.lease(conversation_id).await;
        let _guard = lease.lock_owned().await;

        let page = self
            .api
            .list_messages(conversation_id, self.page_size, None)
            .await
            .map_err(|source| PaginationError::Fetch {
                conversation_id: conversation_id.clone(),
                source,
            })?;

        // Pages arrive newest-first; the window is kept ascending.
        let mut messages: Vec<ChatMessage> = page
            .messages
            .iter()
            .rev()
            .map(ChatMessage::from_payload)
            .collect();
        sort_window(&mut messages);
        messages.dedup_by(|a, b| a.id == b.id);
        let count = messages.len();

        {
            let mut guard = self.inner.lock().await;
            guard.windows.insert(
                conversation_id.clone(),
                MessageWindow {
                    messages,
                    has_more: page.has_more,
                },
            );
        }

        let _ = self.events.send(StreamEvent::InitialLoaded {
            conversation_id: conversation_id.clone(),
            count,
        });
        Ok(count)
    }

    /// Fetches the next older page and prepends it. No-ops when a load is
    /// already in flight for this conversation or history is exhausted.
    pub async fn load_more(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<LoadOutcome, PaginationError> {
        let lease = self.lease(conversation_id).await;
        let Ok(_guard) = lease.try_lock_owned() else {
            return Ok(LoadOutcome::Skipped);
        };

        let before = {
            let guard = self.inner.lock().await;
            let Some(window) = guard.windows.get(conversation_id) else {
                return Ok(LoadOutcome::Skipped);
            };
            if !window.has_more {
                return Ok(LoadOutcome::Skipped);
            }
            window.messages.first().map(|m| m.id.clone())
        };

        let page = self
            .api
            .list_messages(conversation_id, self.page_size, before.as_ref())
            .await
            .map_err(|source| PaginationError::Fetch {
                conversation_id: conversation_id.clone(),
                source,
            })?;

        let prepended = {
            let mut guard = self.inner.lock().await;
            let Some(window) = guard.windows.get_mut(conversation_id) else {
                return Ok(LoadOutcome::Skipped);
            };
            let existing: HashSet<MessageId> =
                window.messages.iter().map(|m| m.id.clone()).collect();
            let mut fresh: Vec<ChatMessage> = page
                .messages
                .iter()
                .rev()
                .filter(|m| !existing.contains(&m.message_id))
                .map(ChatMessage::from_payload)
                .collect();
            let prepended = fresh.len();
            if prepended > 0 {
                fresh.append(&mut window.messages);
                window.messages = fresh;
                sort_window(&mut window.messages);
            }
            window.has_more = page.has_more;
            prepended
        };

        let _ = self.events.send(StreamEvent::PageLoaded {
            conversation_id: conversation_id.clone(),
            prepended,
        });
        Ok(LoadOutcome::Loaded { prepended })
    }

    /// Appends an optimistic `Pending` entry and emits the send. Returns the
    /// temporary id; the entry flips to `Failed` immediately when the
    /// channel is down.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        body: impl Into<String>,
        kind: MessageKind,
        parent_id: Option<MessageId>,
    ) -> Result<MessageId, SendError> {
        let body = body.into();
        let correlation_id = Uuid::new_v4().to_string();
        let message_id = MessageId::local();

        let sender_id = {
            let guard = self.inner.lock().await;
            guard
                .local_user_id
                .clone()
                .ok_or(SendError::NotAuthenticated)?
        };

        let optimistic = ChatMessage {
            id: message_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id,
            body: body.clone(),
            kind,
            parent_id: parent_id.clone(),
            sent_at: Utc::now(),
            delivery: DeliveryState::Pending,
            correlation_id: Some(correlation_id.clone()),
        };

        {
            let mut guard = self.inner.lock().await;
            let window = guard.windows.entry(conversation_id.clone()).or_default();
            window.messages.push(optimistic);
            sort_window(&mut window.messages);
        }
        let _ = self.events.send(StreamEvent::MessageAppended {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            at_tail: true,
        });

        if self.connection.state().await != ConnectionState::Connected {
            warn!(
                conversation_id = %conversation_id,
                "messages: send failed, channel not connected"
            );
            self.set_delivery(conversation_id, &message_id, DeliveryState::Failed)
                .await;
            return Ok(message_id);
        }

        self.connection
            .emit(ClientCommand::SendMessage {
                conversation_id: conversation_id.clone(),
                content: body,
                kind,
                parent_id,
                correlation_id,
            })
            .await;
        Ok(message_id)
    }

    /// Re-emits a failed optimistic entry, reusing its correlation token.
    pub async fn retry_send(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), SendError> {
        if self.connection.state().await != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }

        let command = {
            let mut guard = self.inner.lock().await;
            let window = guard
                .windows
                .get_mut(conversation_id)
                .ok_or_else(|| SendError::UnknownMessage(message_id.clone()))?;
            let entry = window
                .messages
                .iter_mut()
                .find(|m| &m.id == message_id)
                .ok_or_else(|| SendError::UnknownMessage(message_id.clone()))?;
            if entry.delivery != DeliveryState::Failed {
                return Err(SendError::NotRetryable(message_id.clone()));
            }
            entry.delivery = DeliveryState::Pending;
            entry.sent_at = Utc::now();
            let command = ClientCommand::SendMessage {
                conversation_id: conversation_id.clone(),
                content: entry.body.clone(),
                kind: entry.kind,
                parent_id: entry.parent_id.clone(),
                correlation_id: entry
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            };
            // The refreshed timestamp can move the entry past messages that
            // arrived while it sat in `Failed`.
            sort_window(&mut window.messages);
            command
        };

        let _ = self.events.send(StreamEvent::DeliveryUpdated {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            delivery: DeliveryState::Pending,
        });
        self.connection.emit(command).await;
        Ok(())
    }

    /// Flips every outstanding `Pending` entry to `Failed`, across all
    /// windows. Called when the channel goes down: an unconfirmed send can
    /// no longer be acknowledged and must surface as retryable.
    pub async fn fail_inflight_sends(&self) {
        let failed: Vec<(ConversationId, MessageId)> = {
            let mut guard = self.inner.lock().await;
            let mut failed = Vec::new();
            for (conversation_id, window) in guard.windows.iter_mut() {
                for entry in window.messages.iter_mut() {
                    if entry.delivery == DeliveryState::Pending {
                        entry.delivery = DeliveryState::Failed;
                        failed.push((conversation_id.clone(), entry.id.clone()));
                    }
                }
            }
            failed
        };
        for (conversation_id, message_id) in failed {
            warn!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                "messages: channel lost before the send was confirmed"
            );
            let _ = self.events.send(StreamEvent::DeliveryUpdated {
                conversation_id,
                message_id,
                delivery: DeliveryState::Failed,
            });
        }
    }

    /// Merges a pushed `new:message`. A confirmation replaces its optimistic
    /// entry in place (never duplicated); unknown messages are inserted in
    /// timestamp order, at the tail in the common case.
    pub async fn apply_incoming(&self, message: &MessagePayload) {
        enum Outcome {
            Replaced(MessageId),
            Duplicate,
            Inserted { at_tail: bool },
        }

        let outcome = {
            let mut guard = self.inner.lock().await;
            let local_user = guard.local_user_id.clone();
            let Some(window) = guard.windows.get_mut(&message.conversation_id) else {
                // Window never loaded; the directory still handles unread.
                return;
            };

            let correlated = message.correlation_id.as_ref().and_then(|token| {
                window.messages.iter().position(|m| {
                    m.delivery != DeliveryState::Sent
                        && m.correlation_id.as_deref() == Some(token.as_str())
                })
            });
            let matched = correlated.or_else(|| {
                if message.correlation_id.is_some() {
                    return None;
                }
                // Fallback for echoes that lost the token: same sender, same
                // body, still pending, close in time.
                let local_user = local_user.as_ref()?;
                if &message.sender_id != local_user {
                    return None;
                }
                window.messages.iter().position(|m| {
                    m.delivery == DeliveryState::Pending
                        && m.sender_id == message.sender_id
                        && m.body == message.body
                        && (message.sent_at - m.sent_at).num_seconds().abs()
                            <= ECHO_MATCH_WINDOW_SECS
                })
            });

            if let Some(position) = matched {
                let entry = &mut window.messages[position];
                entry.id = message.message_id.clone();
                entry.body = message.body.clone();
                entry.kind = message.kind;
                entry.sent_at = message.sent_at;
                entry.delivery = DeliveryState::Sent;
                sort_window(&mut window.messages);
                Outcome::Replaced(message.message_id.clone())
            } else if window
                .messages
                .iter()
                .any(|m| m.id == message.message_id)
            {
                Outcome::Duplicate
            } else {
                let incoming = ChatMessage::from_payload(message);
                let at_tail = window
                    .messages
                    .last()
                    .map(|tail| sort_key(tail) <= sort_key(&incoming))
                    .unwrap_or(true);
                if at_tail {
                    window.messages.push(incoming);
                } else {
                    let position = window
                        .messages
                        .partition_point(|m| sort_key(m) <= sort_key(&incoming));
                    window.messages.insert(position, incoming);
                }
                Outcome::Inserted { at_tail }
            }
        };

        match outcome {
            Outcome::Replaced(message_id) => {
                let _ = self.events.send(StreamEvent::DeliveryUpdated {
                    conversation_id: message.conversation_id.clone(),
                    message_id,
                    delivery: DeliveryState::Sent,
                });
            }
            Outcome::Inserted { at_tail } => {
                let _ = self.events.send(StreamEvent::MessageAppended {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message.message_id.clone(),
                    at_tail,
                });
            }
            Outcome::Duplicate => {
                debug!(
                    message_id = %message.message_id,
                    "messages: dropping duplicate push"
                );
            }
        }
    }

    /// Marks the conversation read over REST and emits the read receipt.
    /// Called on conversation-open with non-zero unread and on explicit
    /// scroll-to-bottom — never per message receipt.
    pub async fn mark_as_read(&self, conversation_id: &ConversationId) -> Result<()> {
        let lease = self.lease(conversation_id).await;
        let _guard = lease.lock_owned().await;

        self.api.mark_conversation_read(conversation_id).await?;
        self.connection
            .emit(ClientCommand::MarkRead {
                conversation_id: conversation_id.clone(),
            })
            .await;
        Ok(())
    }

    async fn lease(&self, conversation_id: &ConversationId) -> Arc<Mutex<()>> {
        let mut guard = self.inner.lock().await;
        guard
            .leases
            .entry(conversation_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_delivery(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        delivery: DeliveryState,
    ) {
        {
            let mut guard = self.inner.lock().await;
            let Some(window) = guard.windows.get_mut(conversation_id) else {
                return;
            };
            let Some(entry) = window.messages.iter_mut().find(|m| &m.id == message_id) else {
                return;
            };
            entry.delivery = delivery;
        }
        let _ = self.events.send(StreamEvent::DeliveryUpdated {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            delivery,
        });
    }
}

fn sort_key(message: &ChatMessage) -> (DateTime<Utc>, &MessageId) {
    (message.sent_at, &message.id)
}

fn sort_window(messages: &mut [ChatMessage]) {
    messages.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
