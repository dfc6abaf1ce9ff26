//! Wire records of the inference stream and their decoding into [`Frame`].
//!
//! A record is one JSON object per line. Each record is classified exactly
//! once, here, into a closed set of frame types. When a record carries more
//! than one recognised field the highest-priority one wins:
//! content > preamble > status > source domain > routing info > meta >
//! error > done.

use crate::accumulator::{IndicatorChannel, IndicatorSignal};
use crate::constants::USAGE_LIMIT_CODES;
use crate::types::ReasoningEffort;
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Content(String),
    PreambleDelta(String),
    Preamble(String),
    Status(StatusEvent),
    SourceDomain(String),
    ModelInfo(ModelInfo),
    Meta(Box<MetaPayload>),
    Error(StreamFault),
    Done,
}

impl Frame {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Content(_) => "content",
            Self::PreambleDelta(_) | Self::Preamble(_) => "preamble",
            Self::Status(_) => "status",
            Self::SourceDomain(_) => "source_domain",
            Self::ModelInfo(_) => "model_info",
            Self::Meta(_) => "meta",
            Self::Error(_) => "error",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    SearchStart,
    SearchComplete,
    SearchError,
    FileSearchStart,
    FileSearchComplete,
    FileReadStart,
    FileReadComplete,
    FileReadError,
    CodeExecutionStart,
    CodeExecutionComplete,
    CodeExecutionError,
    UsageLimitExceeded,
}

impl StatusKind {
    pub fn parse(raw: &str) -> Option<Self> {
        let kind = match raw {
            "search_start" => Self::SearchStart,
            "search_complete" => Self::SearchComplete,
            "search_error" => Self::SearchError,
            "file_search_start" => Self::FileSearchStart,
            "file_search_complete" => Self::FileSearchComplete,
            "file_read_start" | "file_reading_start" => Self::FileReadStart,
            "file_read_complete" | "file_reading_complete" => Self::FileReadComplete,
            "file_read_error" | "file_reading_error" => Self::FileReadError,
            "code_execution_start" => Self::CodeExecutionStart,
            "code_execution_complete" => Self::CodeExecutionComplete,
            "code_execution_error" => Self::CodeExecutionError,
            "usage_limit_exceeded" => Self::UsageLimitExceeded,
            _ => return None,
        };
        Some(kind)
    }

    /// Channel and transition this status drives, or `None` for statuses that
    /// are not indicator lifecycle events.
    pub fn indicator(self) -> Option<(IndicatorChannel, IndicatorSignal)> {
        use IndicatorChannel::*;
        use IndicatorSignal::*;
        let pair = match self {
            Self::SearchStart => (WebSearch, Start),
            Self::SearchComplete => (WebSearch, Complete),
            Self::SearchError => (WebSearch, Fail),
            Self::FileSearchStart | Self::FileReadStart => (FileReading, Start),
            Self::FileSearchComplete | Self::FileReadComplete => (FileReading, Complete),
            Self::FileReadError => (FileReading, Fail),
            Self::CodeExecutionStart => (CodeExecution, Start),
            Self::CodeExecutionComplete => (CodeExecution, Complete),
            Self::CodeExecutionError => (CodeExecution, Fail),
            Self::UsageLimitExceeded => return None,
        };
        Some(pair)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub query: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub resolved_family: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub speed_mode_used: Option<String>,
    #[serde(default, deserialize_with = "lenient_effort")]
    pub reasoning_effort: Option<ReasoningEffort>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetaPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient_effort")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub resolved_family: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub speed_mode_used: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub assistant_message_row_id: Option<String>,
    #[serde(default)]
    pub context_usage: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub final_content: Option<String>,
}

impl MetaPayload {
    pub fn routing(&self) -> ModelInfo {
        ModelInfo {
            model: self.model.clone(),
            resolved_family: self.resolved_family.clone(),
            speed_mode_used: self.speed_mode_used.clone(),
            reasoning_effort: self.reasoning_effort,
        }
    }

    pub fn server_metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        match &self.metadata {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}

/// An in-band error record.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFault {
    pub message: String,
    pub code: Option<String>,
}

impl StreamFault {
    fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(message) => Self {
                message,
                code: None,
            },
            serde_json::Value::Object(map) => {
                let message = match map.get("message").and_then(|m| m.as_str()) {
                    Some(m) => m.to_string(),
                    None => "Unknown stream error".to_string(),
                };
                let code = map.get("code").and_then(|c| match c {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                });
                Self { message, code }
            }
            other => Self {
                message: other.to_string(),
                code: None,
            },
        }
    }

    pub fn is_usage_limit(&self) -> bool {
        match &self.code {
            Some(code) => USAGE_LIMIT_CODES.contains(&code.as_str()),
            None => false,
        }
    }
}

#[derive(Deserialize)]
struct RawStatus {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    preamble_delta: Option<String>,
    #[serde(default)]
    preamble: Option<String>,
    #[serde(default)]
    status: Option<RawStatus>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    model_info: Option<ModelInfo>,
    #[serde(default)]
    meta: Option<MetaPayload>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    done: Option<bool>,
}

/// Decodes one line into a frame. Malformed and unrecognised records yield
/// `None`; the caller drops them and keeps reading.
pub fn parse_record(line: &str) -> Option<Frame> {
    let raw: RawRecord = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(
                "[DECODE] Dropping malformed record ({}): {}",
                e,
                crate::types::prefix_chars(line, 200)
            );
            return None;
        }
    };

    if let Some(token) = raw.token {
        return Some(Frame::Content(token));
    }
    if let Some(delta) = raw.preamble_delta {
        return Some(Frame::PreambleDelta(delta));
    }
    if let Some(preamble) = raw.preamble {
        return Some(Frame::Preamble(preamble));
    }
    if let Some(status) = raw.status {
        match StatusKind::parse(&status.kind) {
            Some(kind) => {
                return Some(Frame::Status(StatusEvent {
                    kind,
                    query: status.query,
                    message: status.message,
                }))
            }
            None => tracing::debug!("[DECODE] Unknown status type: {}", status.kind),
        }
    }
    if raw.kind.as_deref() == Some("web_search_domain") {
        if let Some(domain) = raw.domain {
            return Some(Frame::SourceDomain(domain));
        }
    }
    if let Some(info) = raw.model_info {
        return Some(Frame::ModelInfo(info));
    }
    if let Some(meta) = raw.meta {
        return Some(Frame::Meta(Box::new(meta)));
    }
    if let Some(err) = raw.error {
        return Some(Frame::Error(StreamFault::from_value(err)));
    }
    if raw.done == Some(true) {
        return Some(Frame::Done);
    }

    tracing::debug!(
        "[DECODE] Unrecognised record: {}",
        crate::types::prefix_chars(line, 200)
    );
    None
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_effort<'de, D>(deserializer: D) -> std::result::Result<Option<ReasoningEffort>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = lenient_string(deserializer)?;
    Ok(value.as_deref().and_then(ReasoningEffort::parse))
}
