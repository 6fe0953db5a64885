//! ABOUTME: Repository for per-user, per-channel delivery preferences
//! ABOUTME: Sending requires enabled + opt_in and a usable contact handle

use crate::Db;
use co_core::{time::now_iso8601, ChannelKind, Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;

/// Preference row for one (user, channel) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreference {
    pub user_id: String,
    pub channel: ChannelKind,
    pub enabled: bool,
    pub opt_in: bool,
    /// Email address, phone number, or empty for token-addressed channels
    pub handle: Option<String>,
    /// Per-notification-kind overrides; absent kinds fall back to the
    /// channel default
    pub type_overrides: HashMap<String, bool>,
    pub updated_at: String,
}

/// Repository for user preferences
#[derive(Clone)]
pub struct UserPreferenceRepository {
    db: Db,
}

impl UserPreferenceRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert or replace the preference row for (user, channel)
    pub async fn upsert(
        &self,
        user_id: &str,
        channel: ChannelKind,
        enabled: bool,
        opt_in: bool,
        handle: Option<&str>,
        type_overrides: &HashMap<String, bool>,
    ) -> Result<()> {
        let now = now_iso8601();
        let overrides_json = serde_json::to_string(type_overrides)
            .map_err(|e| Error::Database(format!("Failed to serialize overrides: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO user_preferences (user_id, channel, enabled, opt_in, handle, type_overrides, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, channel) DO UPDATE SET
                enabled = excluded.enabled,
                opt_in = excluded.opt_in,
                handle = excluded.handle,
                type_overrides = excluded.type_overrides,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(channel.as_str())
        .bind(enabled)
        .bind(opt_in)
        .bind(handle)
        .bind(&overrides_json)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert preference: {}", e)))?;

        Ok(())
    }

    /// Fetch the preference row for (user, channel)
    pub async fn find(&self, user_id: &str, channel: ChannelKind) -> Result<Option<UserPreference>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, channel, enabled, opt_in, handle, type_overrides, updated_at
            FROM user_preferences
            WHERE user_id = ? AND channel = ?
            "#,
        )
        .bind(user_id)
        .bind(channel.as_str())
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to find preference: {}", e)))?;

        row.map(row_to_preference).transpose()
    }

    /// All preference rows for a user
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<UserPreference>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, channel, enabled, opt_in, handle, type_overrides, updated_at
            FROM user_preferences
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to list preferences: {}", e)))?;

        rows.into_iter().map(row_to_preference).collect()
    }
}

fn row_to_preference(row: sqlx::sqlite::SqliteRow) -> Result<UserPreference> {
    let channel_str: String = row
        .try_get("channel")
        .map_err(|e| Error::Database(format!("Failed to get channel: {}", e)))?;
    let channel = ChannelKind::parse(&channel_str)
        .ok_or_else(|| Error::Database(format!("Unknown channel: {}", channel_str)))?;

    let overrides_json: Option<String> = row.try_get("type_overrides").ok().flatten();
    let type_overrides = overrides_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| Error::Database(format!("Failed to deserialize overrides: {}", e)))?
        .unwrap_or_default();

    Ok(UserPreference {
        user_id: row
            .try_get("user_id")
            .map_err(|e| Error::Database(format!("Failed to get user_id: {}", e)))?,
        channel,
        enabled: row
            .try_get("enabled")
            .map_err(|e| Error::Database(format!("Failed to get enabled: {}", e)))?,
        opt_in: row
            .try_get("opt_in")
            .map_err(|e| Error::Database(format!("Failed to get opt_in: {}", e)))?,
        handle: row.try_get("handle").ok().flatten(),
        type_overrides,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| Error::Database(format!("Failed to get updated_at: {}", e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_find() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = UserPreferenceRepository::new(db);

        let mut overrides = HashMap::new();
        overrides.insert("job_alert".to_string(), false);

        repo.upsert("u1", ChannelKind::Email, true, true, Some("a@x.test"), &overrides)
            .await
            .unwrap();

        let pref = repo.find("u1", ChannelKind::Email).await.unwrap().unwrap();
        assert!(pref.enabled);
        assert!(pref.opt_in);
        assert_eq!(pref.handle.as_deref(), Some("a@x.test"));
        assert_eq!(pref.type_overrides.get("job_alert"), Some(&false));

        // Upsert replaces in place
        repo.upsert("u1", ChannelKind::Email, false, true, Some("a@x.test"), &HashMap::new())
            .await
            .unwrap();
        let pref = repo.find("u1", ChannelKind::Email).await.unwrap().unwrap();
        assert!(!pref.enabled);
        assert!(pref.type_overrides.is_empty());
    }

    #[tokio::test]
    async fn test_missing_preference_is_none() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = UserPreferenceRepository::new(db);
        assert!(repo.find("nobody", ChannelKind::Sms).await.unwrap().is_none());
    }
}
