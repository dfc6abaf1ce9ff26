use crate::store::MessageStore;
use crate::types::{
    ConversationId, MessageKey, ResponseMetadata, Result, StoredMessage, StreamKeeperError,
};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(StreamKeeperError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(StreamKeeperError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(StreamKeeperError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    let pragmas = [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA busy_timeout = 5000",
    ];

    for pragma in pragmas {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(StreamKeeperError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Message store initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Local SQLite-backed Message Store.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: DbPool,
}

impl SqliteMessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(init_db(path).await?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn insert_message(
        &self,
        conversation_id: &ConversationId,
        role: &str,
        message: &StoredMessage,
    ) -> Result<()> {
        let metadata_json = serde_json::to_string(&message.metadata)?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, metadata_json, terminal_marker, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                metadata_json = excluded.metadata_json,
                terminal_marker = excluded.terminal_marker",
        )
        .bind(message.id.as_str())
        .bind(&conversation_id.0)
        .bind(role)
        .bind(&message.content)
        .bind(metadata_json)
        .bind(&message.terminal_marker)
        .bind(message.created_at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Ok(t.with_timezone(&Utc)),
        Err(e) => Err(StreamKeeperError::Internal(
            format!("Invalid created_at '{}': {}", raw, e),
            tracing_error::SpanTrace::capture(),
        )
        .into()),
    }
}

impl MessageStore for SqliteMessageStore {
    async fn read_latest_assistant_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, content, metadata_json, terminal_marker, created_at
             FROM messages
             WHERE conversation_id = ? AND role = 'assistant'
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
        )
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let r = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let metadata_json: String = r.get("metadata_json");
        let metadata = match serde_json::from_str::<serde_json::Value>(&metadata_json)? {
            serde_json::Value::Object(map) => ResponseMetadata::from_server_map(map),
            _ => ResponseMetadata::default(),
        };
        let created_at: String = r.get("created_at");

        Ok(Some(StoredMessage {
            id: MessageKey::from(r.get::<String, _>("id")),
            content: r.get("content"),
            metadata,
            created_at: parse_timestamp(&created_at)?,
            terminal_marker: r.get("terminal_marker"),
        }))
    }

    async fn write_metadata(
        &self,
        message_id: &MessageKey,
        metadata: &ResponseMetadata,
    ) -> Result<()> {
        let metadata_json = serde_json::to_string(metadata)?;
        let result = sqlx::query("UPDATE messages SET metadata_json = ? WHERE id = ?")
            .bind(metadata_json)
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StreamKeeperError::NotFound(format!("message {}", message_id)).into());
        }
        tracing::debug!("[DB] Wrote metadata for {}", message_id);
        Ok(())
    }
}
