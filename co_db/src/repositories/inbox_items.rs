//! ABOUTME: Per-user persistent inbox for in-app notifications
//! ABOUTME: Store-and-forward target with read/dismiss tracking and expiry sweep

use crate::Db;
use co_core::{time::now_iso8601, Error, Id, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// One item in a user's inbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: String,
    pub user_id: String,
    pub notification_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub action_url: Option<String>,
    pub icon: Option<String>,
    pub created_at: String,
    pub read_at: Option<String>,
    pub clicked_at: Option<String>,
    pub dismissed_at: Option<String>,
    /// Epoch millis; swept once past
    pub expires_at: Option<i64>,
}

/// Request to create an inbox item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInboxItem {
    pub user_id: String,
    pub notification_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub action_url: Option<String>,
    pub icon: Option<String>,
    pub expires_at: Option<i64>,
}

/// One page of inbox items plus counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxPage {
    pub items: Vec<InboxItem>,
    pub total: i64,
    pub unread_count: i64,
}

/// Repository for inbox items
#[derive(Clone)]
pub struct InboxItemRepository {
    db: Db,
}

impl InboxItemRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Store a new inbox item
    pub async fn create(&self, request: CreateInboxItem) -> Result<InboxItem> {
        let id = Id::new().to_string();
        let now = now_iso8601();

        sqlx::query(
            r#"
            INSERT INTO inbox_items (
                id, user_id, notification_id, kind, title, body,
                action_url, icon, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.user_id)
        .bind(&request.notification_id)
        .bind(&request.kind)
        .bind(&request.title)
        .bind(&request.body)
        .bind(&request.action_url)
        .bind(&request.icon)
        .bind(&now)
        .bind(request.expires_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to create inbox item: {}", e)))?;

        Ok(InboxItem {
            id,
            user_id: request.user_id,
            notification_id: request.notification_id,
            kind: request.kind,
            title: request.title,
            body: request.body,
            action_url: request.action_url,
            icon: request.icon,
            created_at: now,
            read_at: None,
            clicked_at: None,
            dismissed_at: None,
            expires_at: request.expires_at,
        })
    }

    /// Page through a user's inbox, newest first.
    ///
    /// Dismissed items are excluded; `page` is 1-based.
    pub async fn list(
        &self,
        user_id: &str,
        page: i64,
        limit: i64,
        unread_only: bool,
    ) -> Result<InboxPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let offset = (page - 1) * limit;

        let unread_filter = if unread_only { " AND read_at IS NULL" } else { "" };

        let rows = sqlx::query(&format!(
            r#"
            SELECT id, user_id, notification_id, kind, title, body, action_url, icon,
                   created_at, read_at, clicked_at, dismissed_at, expires_at
            FROM inbox_items
            WHERE user_id = ? AND dismissed_at IS NULL{unread_filter}
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to list inbox: {}", e)))?;

        let items = rows
            .into_iter()
            .map(row_to_item)
            .collect::<Result<Vec<_>>>()?;

        let total_row = sqlx::query(&format!(
            "SELECT COUNT(*) as count FROM inbox_items WHERE user_id = ? AND dismissed_at IS NULL{unread_filter}"
        ))
        .bind(user_id)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to count inbox: {}", e)))?;
        let total: i64 = total_row
            .try_get("count")
            .map_err(|e| Error::Database(format!("Failed to get count: {}", e)))?;

        let unread_count = self.unread_count(user_id).await?;

        Ok(InboxPage {
            items,
            total,
            unread_count,
        })
    }

    /// Most recent unread items, for the reconnect backlog
    pub async fn unread(&self, user_id: &str, limit: i64) -> Result<Vec<InboxItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, notification_id, kind, title, body, action_url, icon,
                   created_at, read_at, clicked_at, dismissed_at, expires_at
            FROM inbox_items
            WHERE user_id = ? AND read_at IS NULL AND dismissed_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to list unread: {}", e)))?;

        rows.into_iter().map(row_to_item).collect()
    }

    /// Count of unread, undismissed items
    pub async fn unread_count(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM inbox_items WHERE user_id = ? AND read_at IS NULL AND dismissed_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to count unread: {}", e)))?;

        row.try_get("count")
            .map_err(|e| Error::Database(format!("Failed to get count: {}", e)))
    }

    /// Mark one item read; scoped to its owner
    pub async fn mark_read(&self, id: &str, user_id: &str) -> Result<bool> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE inbox_items SET read_at = ? WHERE id = ? AND user_id = ? AND read_at IS NULL",
        )
        .bind(&now)
        .bind(id)
        .bind(user_id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to mark read: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every unread item read; returns the number affected
    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE inbox_items SET read_at = ? WHERE user_id = ? AND read_at IS NULL AND dismissed_at IS NULL",
        )
        .bind(&now)
        .bind(user_id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to mark all read: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Record a click; also marks the item read
    pub async fn track_click(&self, id: &str, user_id: &str) -> Result<bool> {
        let now = now_iso8601();
        let result = sqlx::query(
            r#"
            UPDATE inbox_items
            SET clicked_at = COALESCE(clicked_at, ?), read_at = COALESCE(read_at, ?)
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(user_id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to track click: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Dismiss one item; scoped to its owner
    pub async fn dismiss(&self, id: &str, user_id: &str) -> Result<bool> {
        let now = now_iso8601();
        let result = sqlx::query(
            "UPDATE inbox_items SET dismissed_at = ? WHERE id = ? AND user_id = ? AND dismissed_at IS NULL",
        )
        .bind(&now)
        .bind(id)
        .bind(user_id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to dismiss: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete items whose expiry instant has passed
    pub async fn sweep_expired(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM inbox_items WHERE expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(now_ms)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to sweep inbox: {}", e)))?;
        Ok(result.rows_affected())
    }

    /// Delete items created before the retention cutoff
    pub async fn purge_older_than(&self, cutoff_iso: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM inbox_items WHERE created_at < ?")
            .bind(cutoff_iso)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to purge inbox: {}", e)))?;
        Ok(result.rows_affected())
    }
}

fn row_to_item(row: sqlx::sqlite::SqliteRow) -> Result<InboxItem> {
    Ok(InboxItem {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("Failed to get id: {}", e)))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| Error::Database(format!("Failed to get user_id: {}", e)))?,
        notification_id: row
            .try_get("notification_id")
            .map_err(|e| Error::Database(format!("Failed to get notification_id: {}", e)))?,
        kind: row
            .try_get("kind")
            .map_err(|e| Error::Database(format!("Failed to get kind: {}", e)))?,
        title: row
            .try_get("title")
            .map_err(|e| Error::Database(format!("Failed to get title: {}", e)))?,
        body: row
            .try_get("body")
            .map_err(|e| Error::Database(format!("Failed to get body: {}", e)))?,
        action_url: row.try_get("action_url").ok().flatten(),
        icon: row.try_get("icon").ok().flatten(),
        created_at: row
            .try_get("created_at")
            .map_err(|e| Error::Database(format!("Failed to get created_at: {}", e)))?,
        read_at: row.try_get("read_at").ok().flatten(),
        clicked_at: row.try_get("clicked_at").ok().flatten(),
        dismissed_at: row.try_get("dismissed_at").ok().flatten(),
        expires_at: row.try_get("expires_at").ok().flatten(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(user: &str, title: &str) -> CreateInboxItem {
        CreateInboxItem {
            user_id: user.to_string(),
            notification_id: "n1".to_string(),
            kind: "job_alert".to_string(),
            title: title.to_string(),
            body: "body".to_string(),
            action_url: None,
            icon: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_list_and_counters() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = InboxItemRepository::new(db);

        let a = repo.create(item("u1", "first")).await.unwrap();
        repo.create(item("u1", "second")).await.unwrap();
        repo.create(item("u2", "other-user")).await.unwrap();

        let page = repo.list("u1", 1, 10, false).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 2);
        assert_eq!(page.unread_count, 2);

        repo.mark_read(&a.id, "u1").await.unwrap();
        let page = repo.list("u1", 1, 10, true).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].title, "second");
        assert_eq!(page.unread_count, 1);
    }

    #[tokio::test]
    async fn test_mark_read_is_owner_scoped() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = InboxItemRepository::new(db);

        let a = repo.create(item("u1", "mine")).await.unwrap();
        assert!(!repo.mark_read(&a.id, "u2").await.unwrap());
        assert!(repo.mark_read(&a.id, "u1").await.unwrap());
        // Second read is a no-op
        assert!(!repo.mark_read(&a.id, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_dismiss_hides_from_lists() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = InboxItemRepository::new(db);

        let a = repo.create(item("u1", "gone")).await.unwrap();
        assert!(repo.dismiss(&a.id, "u1").await.unwrap());

        let page = repo.list("u1", 1, 10, false).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.unread_count, 0);
    }

    #[tokio::test]
    async fn test_track_click_marks_read() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = InboxItemRepository::new(db);

        let a = repo.create(item("u1", "clicky")).await.unwrap();
        assert!(repo.track_click(&a.id, "u1").await.unwrap());
        assert_eq!(repo.unread_count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = InboxItemRepository::new(db);

        let mut expiring = item("u1", "stale");
        expiring.expires_at = Some(1_000);
        repo.create(expiring).await.unwrap();
        repo.create(item("u1", "fresh")).await.unwrap();

        let swept = repo.sweep_expired(2_000).await.unwrap();
        assert_eq!(swept, 1);

        let page = repo.list("u1", 1, 10, false).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].title, "fresh");
    }

    #[tokio::test]
    async fn test_mark_all_read() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = InboxItemRepository::new(db);

        repo.create(item("u1", "a")).await.unwrap();
        repo.create(item("u1", "b")).await.unwrap();

        assert_eq!(repo.mark_all_read("u1").await.unwrap(), 2);
        assert_eq!(repo.unread_count("u1").await.unwrap(), 0);
    }
}
