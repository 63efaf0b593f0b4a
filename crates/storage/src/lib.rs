//! Storage Layer
//!
//! SQLite persistence for upload attempts that could not be delivered and
//! for the last adapter the agent connected to.

mod device;
mod queue;

pub use device::DeviceRecord;
pub use queue::{QueuedUpload, UploadRequest};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Where the database lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path, or `:memory:` for a throwaway store
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "telemetry-agent.db".to_string(),
        }
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS upload_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        endpoint TEXT NOT NULL,
        method TEXT NOT NULL,
        body TEXT NOT NULL,
        submitted_at TEXT NOT NULL,
        enqueued_at TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS last_device (
        slot INTEGER PRIMARY KEY CHECK (slot = 0),
        kind TEXT NOT NULL,
        address TEXT NOT NULL,
        name TEXT,
        saved_at TEXT NOT NULL
    )",
];

/// Durable store shared by the uploader and the agent. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OfflineStore {
    pool: SqlitePool,
}

impl OfflineStore {
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        if config.path == ":memory:" {
            Self::in_memory().await
        } else {
            Self::open_path(&config.path).await
        }
    }

    /// Open (creating if needed) a database file in WAL mode
    pub async fn open_path(path: &str) -> Result<Self, StorageError> {
        info!("Opening offline store at {}", path);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Store that lives as long as the returned value
    pub async fn in_memory() -> Result<Self, StorageError> {
        info!("Creating in-memory offline store");
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection that never idles out, or the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidRecord(format!("{}: {}", field, e)))
}
