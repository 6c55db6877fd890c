use std::time::Duration;

use shared::{
    domain::{ConversationId, MessageId},
    error::ApiError,
};
use thiserror::Error;

/// Connection-level failures. Auth rejections are fatal to the attempt and
/// never retried automatically; transport losses feed the reconnect loop.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("auth token is missing")]
    MissingToken,
    #[error("authentication rejected: {0}")]
    Auth(ApiError),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("channel is not connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("no message {0} in the loaded window")]
    UnknownMessage(MessageId),
    #[error("message {0} is not in a failed state")]
    NotRetryable(MessageId),
    #[error("not authenticated yet")]
    NotAuthenticated,
}

/// History fetch failed. The in-flight lease is always released before this
/// surfaces, so the caller can retry; the loaded window is never touched.
#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("history fetch failed for conversation {conversation_id}: {source}")]
    Fetch {
        conversation_id: ConversationId,
        source: anyhow::Error,
    },
}
