//! Last Connected Device

use crate::{parse_timestamp, OfflineStore, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::debug;

/// The adapter to reconnect to on relaunch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Link kind as text (`notify`, `serial`)
    pub kind: String,
    pub address: String,
    pub name: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn new(kind: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            address: address.into(),
            name: None,
            saved_at: Utc::now(),
        }
    }
}

impl OfflineStore {
    /// Replace the remembered device
    pub async fn save_last_device(&self, device: &DeviceRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO last_device (slot, kind, address, name, saved_at)
             VALUES (0, ?, ?, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET
                kind = excluded.kind,
                address = excluded.address,
                name = excluded.name,
                saved_at = excluded.saved_at",
        )
        .bind(&device.kind)
        .bind(&device.address)
        .bind(&device.name)
        .bind(device.saved_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        debug!("Remembered device {}:{}", device.kind, device.address);
        Ok(())
    }

    pub async fn last_device(&self) -> Result<Option<DeviceRecord>, StorageError> {
        let Some(row) = sqlx::query("SELECT kind, address, name, saved_at FROM last_device WHERE slot = 0")
            .fetch_optional(self.pool())
            .await?
        else {
            return Ok(None);
        };

        let saved_at: String = row.try_get("saved_at")?;
        Ok(Some(DeviceRecord {
            kind: row.try_get("kind")?,
            address: row.try_get("address")?,
            name: row.try_get("name")?,
            saved_at: parse_timestamp("saved_at", &saved_at)?,
        }))
    }

    pub async fn clear_last_device(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM last_device").execute(self.pool()).await?;
        Ok(())
    }
}
