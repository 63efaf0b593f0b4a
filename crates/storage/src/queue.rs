//! Offline Upload Queue

use crate::{parse_timestamp, OfflineStore, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

/// An upload attempt as it would have been sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Path relative to the collector base URL
    pub endpoint: String,
    pub method: String,
    /// Serialized JSON payload
    pub body: String,
    pub submitted_at: DateTime<Utc>,
}

/// A persisted upload attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedUpload {
    pub id: i64,
    pub request: UploadRequest,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl OfflineStore {
    /// Append an attempt to the queue, returning its id
    pub async fn enqueue(&self, request: &UploadRequest) -> Result<i64, StorageError> {
        let result = sqlx::query(
            "INSERT INTO upload_queue (endpoint, method, body, submitted_at, enqueued_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&request.endpoint)
        .bind(&request.method)
        .bind(&request.body)
        .bind(request.submitted_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();
        debug!("Queued upload {} for {}", id, request.endpoint);
        Ok(id)
    }

    /// The entry with the lowest id, if any
    pub async fn peek_oldest(&self) -> Result<Option<QueuedUpload>, StorageError> {
        let row = sqlx::query(
            "SELECT id, endpoint, method, body, submitted_at, enqueued_at, retry_count
             FROM upload_queue ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| queued_from_row(&row)).transpose()
    }

    /// Returns false if no entry had this id
    pub async fn remove(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM upload_queue WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_failure(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE upload_queue SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM upload_queue")
            .fetch_one(self.pool())
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }
}

fn queued_from_row(row: &SqliteRow) -> Result<QueuedUpload, StorageError> {
    let submitted_at: String = row.try_get("submitted_at")?;
    let enqueued_at: String = row.try_get("enqueued_at")?;
    let retry_count: i64 = row.try_get("retry_count")?;

    Ok(QueuedUpload {
        id: row.try_get("id")?,
        request: UploadRequest {
            endpoint: row.try_get("endpoint")?,
            method: row.try_get("method")?,
            body: row.try_get("body")?,
            submitted_at: parse_timestamp("submitted_at", &submitted_at)?,
        },
        enqueued_at: parse_timestamp("enqueued_at", &enqueued_at)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| StorageError::InvalidRecord(format!("retry_count {}", retry_count)))?,
    })
}
