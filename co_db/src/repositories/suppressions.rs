//! ABOUTME: Suppression list of handles that must not be contacted
//! ABOUTME: Populated from hard bounces, complaints, and revoked consent

use crate::Db;
use co_core::{time::now_iso8601, ChannelKind, Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;

/// One suppressed (channel, handle) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suppression {
    pub channel: ChannelKind,
    pub handle: String,
    pub reason: String,
    pub created_at: String,
}

/// Repository for the suppression list
#[derive(Clone)]
pub struct SuppressionRepository {
    db: Db,
}

impl SuppressionRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Add a handle to the suppression list; re-adding keeps the first reason
    pub async fn add(&self, channel: ChannelKind, handle: &str, reason: &str) -> Result<()> {
        let now = now_iso8601();

        let result = sqlx::query(
            r#"
            INSERT INTO suppressions (channel, handle, reason, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (channel, handle) DO NOTHING
            "#,
        )
        .bind(channel.as_str())
        .bind(handle)
        .bind(reason)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to add suppression: {}", e)))?;

        if result.rows_affected() > 0 {
            info!(channel = %channel, reason = %reason, "Added handle to suppression list");
        }
        Ok(())
    }

    /// Whether a handle is suppressed on a channel
    pub async fn is_suppressed(&self, channel: ChannelKind, handle: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM suppressions WHERE channel = ? AND handle = ?",
        )
        .bind(channel.as_str())
        .bind(handle)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to check suppression: {}", e)))?;

        let count: i64 = row
            .try_get("count")
            .map_err(|e| Error::Database(format!("Failed to get count: {}", e)))?;
        Ok(count > 0)
    }

    /// Remove a handle from the suppression list
    pub async fn remove(&self, channel: ChannelKind, handle: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM suppressions WHERE channel = ? AND handle = ?")
            .bind(channel.as_str())
            .bind(handle)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to remove suppression: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }
}
