use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{ConversationSummary, MessagePage},
};

/// REST collaborators for the conversation domain. Kept behind a trait so
/// the directory and message stream can be exercised against fakes.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Conversation list, sorted by activity on the server side.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
    /// Targeted metadata fetch for a single conversation.
    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary>;
    /// One history page, newest-first, older than `before` when given.
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<MessagePage>;
    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()>;
}

#[derive(Serialize)]
struct ListMessagesQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<String>,
}

pub struct HttpConversationApi {
    http: Client,
    server_url: String,
    auth_token: String,
}

impl HttpConversationApi {
    pub fn new(server_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            auth_token: auth_token.into(),
        }
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let conversations = self
            .http
            .get(format!("{}/conversations", self.server_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversations)
    }

    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary> {
        let conversation = self
            .http
            .get(format!(
                "{}/conversations/{}",
                self.server_url, conversation_id
            ))
            .bearer_auth(&self.auth_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversation)
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&MessageId>,
    ) -> Result<MessagePage> {
        let limit = limit.clamp(1, 100);
        let page = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation_id
            ))
            .bearer_auth(&self.auth_token)
            .query(&ListMessagesQuery {
                limit,
                before: before.map(|id| id.0.clone()),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page)
    }

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()> {
        self.http
            .post(format!(
                "{}/conversations/{}/read",
                self.server_url, conversation_id
            ))
            .bearer_auth(&self.auth_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Null object for contexts without a REST backend.
pub struct MissingConversationApi;

#[async_trait]
impl ConversationApi for MissingConversationApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("conversation api is unavailable"))
    }

    async fn fetch_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationSummary> {
        Err(anyhow!(
            "conversation api is unavailable for conversation {conversation_id}"
        ))
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        _limit: u32,
        _before: Option<&MessageId>,
    ) -> Result<MessagePage> {
        Err(anyhow!(
            "conversation api is unavailable for conversation {conversation_id}"
        ))
    }

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()> {
        Err(anyhow!(
            "conversation api is unavailable for conversation {conversation_id}"
        ))
    }
}
