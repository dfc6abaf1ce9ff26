use crate::constants::API_KEY_ENV;
use crate::controller::{ControllerConfig, SubmitRequest};
use crate::db::SqliteMessageStore;
use crate::recovery::PollPolicy;
use crate::store::{HttpMessageStore, StoreBackend};
use crate::transport::{Attachment, ContextMode, ModelOverrides};
use crate::types::*;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Streaming endpoint of the inference service.
    #[arg(long, default_value = "http://127.0.0.1:8080/api/chat/stream")]
    pub endpoint: String,
    /// Base URL of the Message Store API. Uses the local SQLite store when absent.
    #[arg(long)]
    pub store_url: Option<String>,
    #[arg(long, default_value = "streamkeeper.db")]
    pub database: String,
    #[arg(long)]
    pub conversation: String,
    #[arg(long)]
    pub message: String,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long, value_parser = parse_effort)]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[arg(long)]
    pub speed_mode: Option<String>,
    #[arg(long, value_enum, default_value_t = ContextMode::Full)]
    pub context_mode: ContextMode,
    #[arg(long)]
    pub location: Option<String>,
    /// JSON file with extracted attachments (`name`, `mimeType`, `preview`, `status`).
    #[arg(long)]
    pub attachments: Option<String>,
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 8)]
    pub recovery_attempts: u32,
    #[arg(long, default_value_t = 650)]
    pub recovery_interval_ms: u64,
    #[arg(long, default_value_t = 8)]
    pub stall_threshold_secs: u64,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

fn parse_effort(raw: &str) -> std::result::Result<ReasoningEffort, String> {
    match ReasoningEffort::parse(raw) {
        Some(effort) => Ok(effort),
        None => Err(format!(
            "unknown reasoning effort '{}' (expected none, minimal, low, medium or high)",
            raw
        )),
    }
}

impl Args {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            poll: PollPolicy::new(
                self.recovery_attempts,
                Duration::from_millis(self.recovery_interval_ms),
            ),
            stall_threshold: Duration::from_secs(self.stall_threshold_secs),
            ..ControllerConfig::default()
        }
    }

    pub fn submit_request(&self) -> Result<SubmitRequest> {
        if self.message.trim().is_empty() {
            return Err(StreamKeeperError::Config("--message must not be empty".to_string()).into());
        }
        let attachments = match &self.attachments {
            Some(path) => load_attachments(path)?,
            None => Vec::new(),
        };
        Ok(SubmitRequest::new(self.conversation.as_str(), self.message.as_str())
            .with_overrides(ModelOverrides {
                model: self.model.clone(),
                reasoning_effort: self.reasoning_effort,
                speed_mode: self.speed_mode.clone(),
            })
            .with_attachments(attachments)
            .with_location(self.location.clone())
            .with_context_mode(self.context_mode))
    }
}

pub fn load_attachments(path: &str) -> Result<Vec<Attachment>> {
    let raw = std::fs::read_to_string(path)?;
    let attachments: Vec<Attachment> = serde_json::from_str(&raw)?;
    Ok(attachments)
}

pub fn api_key() -> Option<String> {
    match std::env::var(API_KEY_ENV) {
        Ok(k) if !k.trim().is_empty() => Some(k),
        _ => None,
    }
}

/// Client for the response stream. No total timeout: a healthy stream may
/// run for minutes, and a dead one is caught by the stall check.
pub fn build_stream_client(args: &Args) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()?;
    Ok(client)
}

pub fn build_store_client(args: &Args) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_max_idle_per_host(4)
        .build()?;
    Ok(client)
}

pub async fn build_store(args: &Args, api_key: Option<String>) -> Result<StoreBackend> {
    match &args.store_url {
        Some(url) => {
            tracing::info!("Using remote message store at {}", url);
            let client = build_store_client(args)?;
            Ok(StoreBackend::Http(HttpMessageStore::new(client, url.as_str(), api_key)))
        }
        None => {
            tracing::info!("Using local message store at {}", args.database);
            Ok(StoreBackend::Sqlite(SqliteMessageStore::open(&args.database).await?))
        }
    }
}
