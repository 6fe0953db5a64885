//! ABOUTME: Per-user device token registry for push delivery
//! ABOUTME: Provider rejections deactivate tokens; dormant tokens are purged

use crate::Db;
use co_core::{time::now_iso8601, Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::debug;

/// Platform a device token belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Web => "web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ios" => Some(Self::Ios),
            "android" => Some(Self::Android),
            "web" => Some(Self::Web),
            _ => None,
        }
    }
}

/// A registered device token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceToken {
    pub token: String,
    pub user_id: String,
    pub platform: Platform,
    pub active: bool,
    /// Epoch millis of last successful use
    pub last_used: i64,
    pub created_at: String,
}

/// Request to register a device token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDeviceToken {
    pub user_id: String,
    pub token: String,
    pub platform: Platform,
}

/// Repository for device tokens
#[derive(Clone)]
pub struct DeviceTokenRepository {
    db: Db,
}

impl DeviceTokenRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Register (or reactivate) a token for a user
    pub async fn register(&self, request: RegisterDeviceToken, now_ms: i64) -> Result<DeviceToken> {
        let now = now_iso8601();

        sqlx::query(
            r#"
            INSERT INTO device_tokens (token, user_id, platform, active, last_used, created_at)
            VALUES (?, ?, ?, 1, ?, ?)
            ON CONFLICT (token) DO UPDATE SET
                user_id = excluded.user_id,
                platform = excluded.platform,
                active = 1,
                last_used = excluded.last_used
            "#,
        )
        .bind(&request.token)
        .bind(&request.user_id)
        .bind(request.platform.as_str())
        .bind(now_ms)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to register device token: {}", e)))?;

        Ok(DeviceToken {
            token: request.token,
            user_id: request.user_id,
            platform: request.platform,
            active: true,
            last_used: now_ms,
            created_at: now,
        })
    }

    /// Active tokens for a user
    pub async fn active_for_user(&self, user_id: &str) -> Result<Vec<DeviceToken>> {
        let rows = sqlx::query(
            r#"
            SELECT token, user_id, platform, active, last_used, created_at
            FROM device_tokens
            WHERE user_id = ? AND active = 1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to list device tokens: {}", e)))?;

        rows.into_iter().map(row_to_token).collect()
    }

    /// Mark a token inactive after a provider rejection
    pub async fn deactivate(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE device_tokens SET active = 0 WHERE token = ?")
            .bind(token)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to deactivate token: {}", e)))?;

        if result.rows_affected() > 0 {
            debug!(token = %token, "Deactivated device token");
        }
        Ok(result.rows_affected() > 0)
    }

    /// Remove a token entirely (explicit unregister)
    pub async fn remove(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE token = ?")
            .bind(token)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to remove token: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh last_used after a successful send
    pub async fn touch(&self, tokens: &[String], now_ms: i64) -> Result<()> {
        for token in tokens {
            sqlx::query("UPDATE device_tokens SET last_used = ? WHERE token = ?")
                .bind(now_ms)
                .bind(token)
                .execute(self.db.pool())
                .await
                .map_err(|e| Error::Database(format!("Failed to touch token: {}", e)))?;
        }
        Ok(())
    }

    /// Delete tokens dormant since before the cutoff (30-day purge)
    pub async fn purge_dormant(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE last_used < ?")
            .bind(cutoff_ms)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to purge tokens: {}", e)))?;
        Ok(result.rows_affected())
    }
}

fn row_to_token(row: sqlx::sqlite::SqliteRow) -> Result<DeviceToken> {
    let platform_str: String = row
        .try_get("platform")
        .map_err(|e| Error::Database(format!("Failed to get platform: {}", e)))?;
    let platform = Platform::parse(&platform_str)
        .ok_or_else(|| Error::Database(format!("Unknown platform: {}", platform_str)))?;

    Ok(DeviceToken {
        token: row
            .try_get("token")
            .map_err(|e| Error::Database(format!("Failed to get token: {}", e)))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| Error::Database(format!("Failed to get user_id: {}", e)))?,
        platform,
        active: row
            .try_get("active")
            .map_err(|e| Error::Database(format!("Failed to get active: {}", e)))?,
        last_used: row
            .try_get("last_used")
            .map_err(|e| Error::Database(format!("Failed to get last_used: {}", e)))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| Error::Database(format!("Failed to get created_at: {}", e)))?,
    })
}
