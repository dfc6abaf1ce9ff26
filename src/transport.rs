//! Outbound request and the byte-stream transport.

use crate::types::{ConversationId, ReasoningEffort, Result, StreamKeeperError};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub type ByteStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    #[default]
    Full,
    Recent,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mode: Option<String>,
}

/// An attachment as returned by the extraction service. Passed through as is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub preview: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub conversation_id: ConversationId,
    pub message: String,
    pub model_overrides: ModelOverrides,
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub context_mode: ContextMode,
}

pub trait ResponseTransport: Send + Sync + 'static {
    /// Opens the response stream. The returned body ends once `cancel` fires.
    fn open(
        &self,
        request: &OutboundRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<ByteStream>> + Send;
}

/// Ends `body` as soon as `cancel` fires, dropping the underlying connection.
pub fn cancellable(body: ByteStream, cancel: CancellationToken) -> ByteStream {
    Box::pin(body.take_until(async move { cancel.cancelled().await }))
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

impl ResponseTransport for HttpTransport {
    async fn open(
        &self,
        request: &OutboundRequest,
        cancel: CancellationToken,
    ) -> Result<ByteStream> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/x-ndjson")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        tracing::debug!(
            "[TRANSPORT] POST {} ({} chars, {} attachments)",
            self.endpoint,
            request.message.chars().count(),
            request.attachments.len()
        );
        let response = builder.send().await.map_err(StreamKeeperError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(StreamKeeperError::UsageLimitExceeded(body).into());
            }
            return Err(StreamKeeperError::Upstream(status, body).into());
        }

        let body = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        Ok(cancellable(Box::pin(body), cancel))
    }
}
