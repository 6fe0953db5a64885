//! ABOUTME: Repository for logical notifications, the intake-side entity
//! ABOUTME: Notifications are immutable after insert; jobs reference them by id

use crate::Db;
use co_core::{time::now_iso8601, ChannelKind, Error, Id, Priority, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;

/// A persisted logical notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    /// Domain category, e.g. `job_alert`
    pub kind: String,
    pub priority: Priority,
    pub channels: Vec<ChannelKind>,
    pub template_id: Option<String>,
    pub variables: HashMap<String, String>,
    /// Explicit payload when no template is referenced
    pub payload: Option<serde_json::Value>,
    /// Epoch millis; delivery deferred until this instant
    pub scheduled_for: Option<i64>,
    /// Epoch millis; jobs expire past this instant
    pub expires_at: Option<i64>,
    pub metadata: Option<HashMap<String, String>>,
    pub created_at: String,
}

/// Request to persist a new notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotification {
    pub user_id: String,
    pub kind: String,
    pub priority: Priority,
    pub channels: Vec<ChannelKind>,
    pub template_id: Option<String>,
    pub variables: HashMap<String, String>,
    pub payload: Option<serde_json::Value>,
    pub scheduled_for: Option<i64>,
    pub expires_at: Option<i64>,
    pub metadata: Option<HashMap<String, String>>,
}

/// Repository for notifications
#[derive(Clone)]
pub struct NotificationRepository {
    db: Db,
}

impl NotificationRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a notification inside an open transaction.
    ///
    /// The orchestrator persists the notification together with its jobs
    /// as a single transactional unit.
    pub async fn insert_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        request: CreateNotification,
    ) -> Result<Notification> {
        let id = Id::new().to_string();
        let now = now_iso8601();

        let channels_json = serde_json::to_string(&request.channels)
            .map_err(|e| Error::Database(format!("Failed to serialize channels: {}", e)))?;
        let variables_json = serde_json::to_string(&request.variables)
            .map_err(|e| Error::Database(format!("Failed to serialize variables: {}", e)))?;
        let payload_json = request
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Database(format!("Failed to serialize payload: {}", e)))?;
        let metadata_json = request
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Database(format!("Failed to serialize metadata: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, user_id, kind, priority, channels, template_id, variables,
                payload, scheduled_for, expires_at, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.user_id)
        .bind(&request.kind)
        .bind(request.priority.as_str())
        .bind(&channels_json)
        .bind(&request.template_id)
        .bind(&variables_json)
        .bind(&payload_json)
        .bind(request.scheduled_for)
        .bind(request.expires_at)
        .bind(&metadata_json)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to create notification: {}", e)))?;

        Ok(Notification {
            id,
            user_id: request.user_id,
            kind: request.kind,
            priority: request.priority,
            channels: request.channels,
            template_id: request.template_id,
            variables: request.variables,
            payload: request.payload,
            scheduled_for: request.scheduled_for,
            expires_at: request.expires_at,
            metadata: request.metadata,
            created_at: now,
        })
    }

    /// Find a notification by id
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Notification>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, kind, priority, channels, template_id, variables,
                   payload, scheduled_for, expires_at, metadata, created_at
            FROM notifications
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to find notification: {}", e)))?;

        row.map(row_to_notification).transpose()
    }
}

fn row_to_notification(row: sqlx::sqlite::SqliteRow) -> Result<Notification> {
    let priority_str: String = row
        .try_get("priority")
        .map_err(|e| Error::Database(format!("Failed to get priority: {}", e)))?;
    let priority = Priority::parse(&priority_str)
        .ok_or_else(|| Error::Database(format!("Unknown priority: {}", priority_str)))?;

    let channels_json: String = row
        .try_get("channels")
        .map_err(|e| Error::Database(format!("Failed to get channels: {}", e)))?;
    let channels: Vec<ChannelKind> = serde_json::from_str(&channels_json)
        .map_err(|e| Error::Database(format!("Failed to deserialize channels: {}", e)))?;

    let variables_json: String = row
        .try_get("variables")
        .map_err(|e| Error::Database(format!("Failed to get variables: {}", e)))?;
    let variables = serde_json::from_str(&variables_json)
        .map_err(|e| Error::Database(format!("Failed to deserialize variables: {}", e)))?;

    let payload_json: Option<String> = row.try_get("payload").ok().flatten();
    let payload = payload_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| Error::Database(format!("Failed to deserialize payload: {}", e)))?;

    let metadata_json: Option<String> = row.try_get("metadata").ok().flatten();
    let metadata = metadata_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| Error::Database(format!("Failed to deserialize metadata: {}", e)))?;

    Ok(Notification {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("Failed to get id: {}", e)))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| Error::Database(format!("Failed to get user_id: {}", e)))?,
        kind: row
            .try_get("kind")
            .map_err(|e| Error::Database(format!("Failed to get kind: {}", e)))?,
        priority,
        channels,
        template_id: row.try_get("template_id").ok().flatten(),
        variables,
        payload,
        scheduled_for: row.try_get("scheduled_for").ok().flatten(),
        expires_at: row.try_get("expires_at").ok().flatten(),
        metadata,
        created_at: row
            .try_get("created_at")
            .map_err(|e| Error::Database(format!("Failed to get created_at: {}", e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        Db::new_in_memory().await.expect("in-memory db")
    }

    fn sample_request() -> CreateNotification {
        let mut variables = HashMap::new();
        variables.insert("job".to_string(), "Engineer".to_string());

        CreateNotification {
            user_id: "u1".to_string(),
            kind: "job_alert".to_string(),
            priority: Priority::Normal,
            channels: vec![ChannelKind::Email, ChannelKind::InApp],
            template_id: Some("ja-1".to_string()),
            variables,
            payload: None,
            scheduled_for: None,
            expires_at: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let db = test_db().await;
        let repo = NotificationRepository::new(db.clone());

        let mut tx = db.pool().begin().await.unwrap();
        let created = NotificationRepository::insert_in_tx(&mut tx, sample_request())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let found = repo.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
        assert_eq!(found.kind, "job_alert");
        assert_eq!(found.priority, Priority::Normal);
        assert_eq!(found.channels, vec![ChannelKind::Email, ChannelKind::InApp]);
        assert_eq!(found.variables.get("job").map(String::as_str), Some("Engineer"));
    }

    #[tokio::test]
    async fn test_rollback_leaves_nothing() {
        let db = test_db().await;
        let repo = NotificationRepository::new(db.clone());

        let mut tx = db.pool().begin().await.unwrap();
        let created = NotificationRepository::insert_in_tx(&mut tx, sample_request())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(repo.find_by_id(&created.id).await.unwrap().is_none());
    }
}
