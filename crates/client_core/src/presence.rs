use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ChannelEvent, ClientCommand},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::warn;

use crate::connection::ChannelConnection;

struct LocalTyping {
    active: bool,
    last_notice: Instant,
    stop_task: Option<JoinHandle<()>>,
}

struct PresenceState {
    online: HashSet<UserId>,
    /// Typing entries keyed by conversation, each with the last moment the
    /// server reported the user typing. Entries expire if the stop event is
    /// lost.
    typing: HashMap<ConversationId, HashMap<UserId, Instant>>,
    local: HashMap<ConversationId, LocalTyping>,
}

/// Derives online/offline and typing state from push events and debounces
/// the local "I am typing" emission.
pub struct PresenceTracker {
    connection: Arc<ChannelConnection>,
    typing_expiry: Duration,
    typing_idle_stop: Duration,
    inner: Mutex<PresenceState>,
}

impl PresenceTracker {
    pub fn new(
        connection: Arc<ChannelConnection>,
        typing_expiry: Duration,
        typing_idle_stop: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            typing_expiry,
            typing_idle_stop,
            inner: Mutex::new(PresenceState {
                online: HashSet::new(),
                typing: HashMap::new(),
                local: HashMap::new(),
            }),
        })
    }

    /// Applies one push event. Non-presence events are ignored so the
    /// dispatch loop can forward everything unconditionally.
    pub async fn apply_event(&self, event: &ChannelEvent) {
        let mut guard = self.inner.lock().await;
        match event {
            ChannelEvent::UserOnline { user_id } => {
                guard.online.insert(user_id.clone());
            }
            ChannelEvent::UserOffline { user_id } => {
                guard.online.remove(user_id);
                for typing in guard.typing.values_mut() {
                    typing.remove(user_id);
                }
            }
            ChannelEvent::PresenceUpdated { user_id, status } => {
                if status.is_online() {
                    guard.online.insert(user_id.clone());
                } else {
                    guard.online.remove(user_id);
                }
            }
            ChannelEvent::TypingStarted {
                conversation_id,
                user_id,
            } => {
                guard
                    .typing
                    .entry(conversation_id.clone())
                    .or_default()
                    .insert(user_id.clone(), Instant::now());
            }
            ChannelEvent::TypingStopped {
                conversation_id,
                user_id,
            } => {
                if let Some(typing) = guard.typing.get_mut(conversation_id) {
                    typing.remove(user_id);
                }
            }
            _ => {}
        }
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.lock().await.online.contains(user_id)
    }

    /// Users currently typing in a conversation. Entries older than the
    /// expiry window are evicted here, which covers lost stop events.
    pub async fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        let mut guard = self.inner.lock().await;
        let expiry = self.typing_expiry;
        let Some(typing) = guard.typing.get_mut(conversation_id) else {
            return Vec::new();
        };
        typing.retain(|_, last_seen| last_seen.elapsed() < expiry);
        let mut users: Vec<UserId> = typing.keys().cloned().collect();
        users.sort();
        users
    }

    /// Reports local keyboard activity. Emits `message:typing:start` at most
    /// once per active period and (re)schedules the automatic stop, so
    /// continuous typing produces a single start event instead of a flood.
    pub async fn notice_local_typing(self: &Arc<Self>, conversation_id: &ConversationId) {
        let should_emit = {
            let mut guard = self.inner.lock().await;
            let entry = guard
                .local
                .entry(conversation_id.clone())
                .or_insert_with(|| LocalTyping {
                    active: false,
                    last_notice: Instant::now(),
                    stop_task: None,
                });
            entry.last_notice = Instant::now();
            let should_emit = !entry.active;
            entry.active = true;
            if let Some(task) = entry.stop_task.take() {
                task.abort();
            }
            entry.stop_task = Some(self.spawn_auto_stop(conversation_id.clone()));
            should_emit
        };

        if should_emit {
            self.connection
                .emit(ClientCommand::TypingStarted {
                    conversation_id: conversation_id.clone(),
                })
                .await;
        }
    }

    /// Stops the local typing indicator eagerly, e.g. when the composer is
    /// cleared or the message is sent.
    pub async fn stop_local_typing(&self, conversation_id: &ConversationId) {
        let was_active = {
            let mut guard = self.inner.lock().await;
            match guard.local.remove(conversation_id) {
                Some(entry) => {
                    if let Some(task) = entry.stop_task {
                        task.abort();
                    }
                    entry.active
                }
                None => false,
            }
        };
        if was_active {
            self.connection
                .emit(ClientCommand::TypingStopped {
                    conversation_id: conversation_id.clone(),
                })
                .await;
        }
    }

    fn spawn_auto_stop(self: &Arc<Self>, conversation_id: ConversationId) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let idle = self.typing_idle_stop;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            // Cannot go through stop_local_typing here: it would abort this
            // very task before the stop event gets emitted.
            let was_active = {
                let mut guard = tracker.inner.lock().await;
                let still_idle = guard
                    .local
                    .get(&conversation_id)
                    .is_some_and(|entry| entry.active && entry.last_notice.elapsed() >= idle);
                if !still_idle {
                    // A newer notice rescheduled its own stop task.
                    return;
                }
                guard.local.remove(&conversation_id).is_some()
            };
            if was_active {
                tracker
                    .connection
                    .emit(ClientCommand::TypingStopped {
                        conversation_id: conversation_id.clone(),
                    })
                    .await;
            }
        })
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Ok(guard) = self.inner.try_lock() {
            for entry in guard.local.values() {
                if let Some(task) = &entry.stop_task {
                    task.abort();
                }
            }
        } else {
            warn!("presence: tracker dropped while locked, leaking stop tasks");
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
