//! Message Store collaborators: the persisted side recovery reconciles with.

use crate::db::SqliteMessageStore;
use crate::types::{
    ConversationId, MessageKey, ResponseMetadata, Result, StoredMessage, StreamKeeperError,
};
use std::future::Future;

pub trait MessageStore: Send + Sync + 'static {
    /// Most recent assistant record of the conversation, if any.
    fn read_latest_assistant_record(
        &self,
        conversation_id: &ConversationId,
    ) -> impl Future<Output = Result<Option<StoredMessage>>> + Send;

    fn write_metadata(
        &self,
        message_id: &MessageKey,
        metadata: &ResponseMetadata,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Message Store reached over its REST API.
#[derive(Clone)]
pub struct HttpMessageStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMessageStore {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }
}

async fn error_body(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(t) => t,
        Err(_) => "Unknown error (failed to read response text)".to_string(),
    }
}

impl MessageStore for HttpMessageStore {
    async fn read_latest_assistant_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredMessage>> {
        let url = format!(
            "{}/conversations/{}/messages/latest",
            self.base_url, conversation_id
        );
        let response = self
            .authorize(self.client.get(&url).query(&[("role", "assistant")]))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(StreamKeeperError::Upstream(status, body).into());
        }
        let record: StoredMessage = response.json().await?;
        Ok(Some(record))
    }

    async fn write_metadata(
        &self,
        message_id: &MessageKey,
        metadata: &ResponseMetadata,
    ) -> Result<()> {
        let url = format!("{}/messages/{}/metadata", self.base_url, message_id);
        let response = self
            .authorize(self.client.patch(&url).json(metadata))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StreamKeeperError::NotFound(format!("message {}", message_id)).into());
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(StreamKeeperError::Upstream(status, body).into());
        }
        Ok(())
    }
}

/// Store picked at startup.
pub enum StoreBackend {
    Http(HttpMessageStore),
    Sqlite(SqliteMessageStore),
}

impl MessageStore for StoreBackend {
    async fn read_latest_assistant_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredMessage>> {
        match self {
            Self::Http(store) => store.read_latest_assistant_record(conversation_id).await,
            Self::Sqlite(store) => store.read_latest_assistant_record(conversation_id).await,
        }
    }

    async fn write_metadata(
        &self,
        message_id: &MessageKey,
        metadata: &ResponseMetadata,
    ) -> Result<()> {
        match self {
            Self::Http(store) => store.write_metadata(message_id, metadata).await,
            Self::Sqlite(store) => store.write_metadata(message_id, metadata).await,
        }
    }
}
