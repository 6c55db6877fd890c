use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, MessageId, MessageKind, PresenceStatus, UserId},
    error::ApiError,
};

/// A message as the server reports it, over the push channel and in REST
/// history pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
    /// Echoed back from `ClientCommand::SendMessage` so the sender can match
    /// the confirmation against its optimistic entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Identity snapshot of the other participant in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterpartProfile {
    pub user_id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub counterpart: CounterpartProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    #[serde(default)]
    pub unread_count: u32,
    pub last_activity_at: DateTime<Utc>,
}

/// One REST history page. Pages are served newest-first; `has_more` reports
/// whether older history exists past the oldest entry of this page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    #[serde(default)]
    pub has_more: bool,
}

/// Everything the server pushes over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelEvent {
    AuthAck {
        user_id: UserId,
    },
    AuthRejected {
        error: ApiError,
    },
    NewMessage {
        message: MessagePayload,
    },
    TypingStarted {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    TypingStopped {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    MessageRead {
        conversation_id: ConversationId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to_message_id: Option<MessageId>,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    PresenceUpdated {
        user_id: UserId,
        status: PresenceStatus,
    },
    ConversationJoined {
        conversation_id: ConversationId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ApiError>,
    },
    Error(ApiError),
}

/// Everything the client emits over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    Authenticate {
        token: String,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<MessageId>,
        correlation_id: String,
    },
    TypingStarted {
        conversation_id: ConversationId,
    },
    TypingStopped {
        conversation_id: ConversationId,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
}
