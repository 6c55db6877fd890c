use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationSummary, MessagePayload},
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::rest::ConversationApi;

struct DirectoryState {
    /// Sorted by last activity, newest first.
    conversations: Vec<ConversationSummary>,
    active: Option<ConversationId>,
    local_user_id: Option<UserId>,
}

/// Owns the ordered conversation list and its unread state, fed by both the
/// REST fetch and push events.
pub struct ConversationDirectory {
    api: Arc<dyn ConversationApi>,
    inner: Mutex<DirectoryState>,
}

impl ConversationDirectory {
    pub fn new(api: Arc<dyn ConversationApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            inner: Mutex::new(DirectoryState {
                conversations: Vec::new(),
                active: None,
                local_user_id: None,
            }),
        })
    }

    pub async fn set_local_user(&self, user_id: UserId) {
        self.inner.lock().await.local_user_id = Some(user_id);
    }

    /// Full list fetch; replaces the local view.
    pub async fn refresh(&self) -> Result<()> {
        let mut conversations = self.api.list_conversations().await?;
        sort_by_activity(&mut conversations);
        self.inner.lock().await.conversations = conversations;
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.conversations.clone()
    }

    pub async fn unread_count(&self, conversation_id: &ConversationId) -> u32 {
        self.inner
            .lock()
            .await
            .conversations
            .iter()
            .find(|c| &c.conversation_id == conversation_id)
            .map(|c| c.unread_count)
            .unwrap_or(0)
    }

    pub async fn set_active(&self, conversation_id: Option<ConversationId>) {
        self.inner.lock().await.active = conversation_id;
    }

    pub async fn active(&self) -> Option<ConversationId> {
        self.inner.lock().await.active.clone()
    }

    /// Applies an inbound `new:message` push: updates the affected entry in
    /// place and resorts, or triggers one targeted refetch when the
    /// conversation is unknown. Never reloads the whole list.
    pub async fn apply_new_message(&self, message: &MessagePayload) {
        let known = {
            let mut guard = self.inner.lock().await;
            let inbound = guard.local_user_id.as_ref() != Some(&message.sender_id);
            let is_active = guard.active.as_ref() == Some(&message.conversation_id);
            match guard
                .conversations
                .iter_mut()
                .find(|c| c.conversation_id == message.conversation_id)
            {
                Some(entry) => {
                    entry.last_message = Some(message.clone());
                    entry.last_activity_at = message.sent_at;
                    if inbound && !is_active {
                        entry.unread_count += 1;
                    }
                    sort_by_activity(&mut guard.conversations);
                    true
                }
                None => false,
            }
        };

        if known {
            return;
        }

        match self.api.fetch_conversation(&message.conversation_id).await {
            Ok(fetched) => {
                let mut guard = self.inner.lock().await;
                // The push may have raced another refetch for the same id.
                if guard
                    .conversations
                    .iter()
                    .any(|c| c.conversation_id == fetched.conversation_id)
                {
                    return;
                }
                guard.conversations.push(fetched);
                sort_by_activity(&mut guard.conversations);
            }
            Err(err) => {
                warn!(
                    conversation_id = %message.conversation_id,
                    "directory: targeted refetch failed: {err}"
                );
            }
        }
    }

    /// Zeroes the unread count locally. The REST call and the read-receipt
    /// emission live in `MessageStream::mark_as_read`, which takes the
    /// per-conversation lease first.
    pub async fn clear_unread(&self, conversation_id: &ConversationId) {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard
            .conversations
            .iter_mut()
            .find(|c| &c.conversation_id == conversation_id)
        {
            entry.unread_count = 0;
        }
    }

    /// Inbound `message:read` for the local user (another device read the
    /// conversation) converges the unread count to zero.
    pub async fn apply_message_read(&self, conversation_id: &ConversationId, user_id: &UserId) {
        let mut guard = self.inner.lock().await;
        if guard.local_user_id.as_ref() != Some(user_id) {
            return;
        }
        if let Some(entry) = guard
            .conversations
            .iter_mut()
            .find(|c| &c.conversation_id == conversation_id)
        {
            entry.unread_count = 0;
        }
    }
}

fn sort_by_activity(conversations: &mut [ConversationSummary]) {
    conversations.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
