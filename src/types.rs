use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

const EPHEMERAL_PREFIX: &str = "local-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

/// Identifies a displayed message. Starts out ephemeral (`local-…`) for an
/// in-flight draft and is replaced by the backend row id on promotion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageKey(pub String);

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ConversationId {
    pub fn short(&self) -> &str {
        prefix_chars(&self.0, 6)
    }
}

impl MessageKey {
    pub fn ephemeral() -> Self {
        Self(format!("{}{}", EPHEMERAL_PREFIX, Uuid::new_v4().simple()))
    }

    pub fn is_ephemeral(&self) -> bool {
        self.0.starts_with(EPHEMERAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns a prefix of the string with at most `max_chars` characters,
/// respecting UTF-8 boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Length in characters, which is what "content length" means everywhere in
/// this crate.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[derive(Error, Debug)]
pub enum StreamKeeperError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport failed before any record arrived: {0}")]
    Transport(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(reqwest::StatusCode, String),

    #[error("Duplicate request rejected for session {0}")]
    DuplicateRequest(String),

    #[error("Usage limit exceeded: {0}")]
    UsageLimitExceeded(String),

    #[error("Stream reported an error: {0}")]
    Stream(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl StreamKeeperError {
    /// Errors the caller should present as an application notification rather
    /// than a generic failure.
    pub fn is_usage_limit(&self) -> bool {
        matches!(self, Self::UsageLimitExceeded(_))
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: StreamKeeperError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<StreamKeeperError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    /// Lenient parse of the wire value; unknown strings yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Whether this effort level earns the extended "thinking longer" indicator.
    pub fn is_extended(self) -> bool {
        matches!(self, Self::Medium | Self::High)
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Metadata shown alongside an assistant message. Known fields are typed;
/// anything else the server sends is kept in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mode_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_usage: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResponseMetadata {
    /// Lenient conversion of a server-sent metadata object. A field with an
    /// unexpected type does not discard the rest: the whole object lands in
    /// `extra` instead.
    pub fn from_server_map(map: serde_json::Map<String, serde_json::Value>) -> Self {
        match serde_json::from_value::<ResponseMetadata>(serde_json::Value::Object(map.clone())) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!("Server metadata did not match known shape: {}", e);
                Self {
                    extra: map,
                    ..Self::default()
                }
            }
        }
    }

    /// Fills fields that are still unset from `other`. Fields already set are
    /// never overwritten, which is what makes repeated merges idempotent.
    pub fn fill_missing_from(&mut self, other: &ResponseMetadata) {
        fill(&mut self.model, &other.model);
        fill(&mut self.resolved_family, &other.resolved_family);
        fill(&mut self.speed_mode_used, &other.speed_mode_used);
        fill(&mut self.reasoning_effort, &other.reasoning_effort);
        fill(&mut self.thinking_ms, &other.thinking_ms);
        fill(&mut self.thinking_label, &other.thinking_label);
        fill(&mut self.context_usage, &other.context_usage);
        fill(&mut self.error, &other.error);
        if self.search_domains.is_empty() {
            self.search_domains = other.search_domains.clone();
        }
        for (k, v) in &other.extra {
            self.extra.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(value);
    }
}

/// The most recent assistant record as persisted by the Message Store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: MessageKey,
    pub content: String,
    #[serde(default)]
    pub metadata: ResponseMetadata,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Backend-only completion marker, e.g. a persisted external response id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_marker: Option<String>,
}
