//! ABOUTME: Template repository for channel-specific notification content
//! ABOUTME: Templates are immutable once referenced by a persisted notification

use crate::Db;
use co_core::{time::now_iso8601, ChannelKind, Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// Template entity for one (template_id, channel) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub channel: ChannelKind,
    /// Email subject line
    pub subject: Option<String>,
    /// Text body (all channels)
    pub body: String,
    /// HTML body (email only)
    pub html: Option<String>,
    /// Title (push and in-app)
    pub title: Option<String>,
    /// Data section template (push only), JSON
    pub data: Option<serde_json::Value>,
    /// Whitelisted variable names
    pub variables: Vec<String>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Repository for templates
#[derive(Clone)]
pub struct TemplateRepository {
    db: Db,
}

impl TemplateRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert or replace a template row
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        id: &str,
        channel: ChannelKind,
        subject: Option<&str>,
        body: &str,
        html: Option<&str>,
        title: Option<&str>,
        data: Option<&serde_json::Value>,
        variables: &[String],
    ) -> Result<Template> {
        let now = now_iso8601();
        let variables_json = serde_json::to_string(variables)
            .map_err(|e| Error::Database(format!("Failed to serialize variables: {}", e)))?;
        let data_json = data
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Database(format!("Failed to serialize data: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO templates (id, channel, subject, body, html, title, data, variables, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (id, channel) DO UPDATE SET
                subject = excluded.subject,
                body = excluded.body,
                html = excluded.html,
                title = excluded.title,
                data = excluded.data,
                variables = excluded.variables,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(channel.as_str())
        .bind(subject)
        .bind(body)
        .bind(html)
        .bind(title)
        .bind(&data_json)
        .bind(&variables_json)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert template: {}", e)))?;

        Ok(Template {
            id: id.to_string(),
            channel,
            subject: subject.map(String::from),
            body: body.to_string(),
            html: html.map(String::from),
            title: title.map(String::from),
            data: data.cloned(),
            variables: variables.to_vec(),
            active: true,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Find the template for one (id, channel)
    pub async fn find(&self, id: &str, channel: ChannelKind) -> Result<Option<Template>> {
        let row = sqlx::query(
            r#"
            SELECT id, channel, subject, body, html, title, data, variables, active, created_at, updated_at
            FROM templates
            WHERE id = ? AND channel = ?
            "#,
        )
        .bind(id)
        .bind(channel.as_str())
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to find template: {}", e)))?;

        row.map(row_to_template).transpose()
    }

    /// Whether any channel variant exists for a template id
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM templates WHERE id = ?")
            .bind(id)
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to check template: {}", e)))?;

        let count: i64 = row
            .try_get("count")
            .map_err(|e| Error::Database(format!("Failed to get count: {}", e)))?;
        Ok(count > 0)
    }

    /// Activate or deactivate a template id across all channels
    pub async fn set_active(&self, id: &str, active: bool) -> Result<u64> {
        let now = now_iso8601();
        let result = sqlx::query("UPDATE templates SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(&now)
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to set template active: {}", e)))?;
        Ok(result.rows_affected())
    }
}

fn row_to_template(row: sqlx::sqlite::SqliteRow) -> Result<Template> {
    let channel_str: String = row
        .try_get("channel")
        .map_err(|e| Error::Database(format!("Failed to get channel: {}", e)))?;
    let channel = ChannelKind::parse(&channel_str)
        .ok_or_else(|| Error::Database(format!("Unknown channel: {}", channel_str)))?;

    let variables_json: String = row
        .try_get("variables")
        .map_err(|e| Error::Database(format!("Failed to get variables: {}", e)))?;
    let variables = serde_json::from_str(&variables_json)
        .map_err(|e| Error::Database(format!("Failed to deserialize variables: {}", e)))?;

    let data_json: Option<String> = row.try_get("data").ok().flatten();
    let data = data_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| Error::Database(format!("Failed to deserialize data: {}", e)))?;

    Ok(Template {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("Failed to get id: {}", e)))?,
        channel,
        subject: row.try_get("subject").ok().flatten(),
        body: row
            .try_get("body")
            .map_err(|e| Error::Database(format!("Failed to get body: {}", e)))?,
        html: row.try_get("html").ok().flatten(),
        title: row.try_get("title").ok().flatten(),
        data,
        variables,
        active: row
            .try_get("active")
            .map_err(|e| Error::Database(format!("Failed to get active: {}", e)))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| Error::Database(format!("Failed to get created_at: {}", e)))?,
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
        let repo = TemplateRepository::new(db);

        repo.upsert(
            "ja-1",
            ChannelKind::Email,
            Some("New job: {{job}}"),
            "A {{job}} role is waiting for you.",
            Some("<p>A {{job}} role is waiting for you.</p>"),
            None,
            None,
            &["job".to_string()],
        )
        .await
        .unwrap();

        let template = repo.find("ja-1", ChannelKind::Email).await.unwrap().unwrap();
        assert_eq!(template.subject.as_deref(), Some("New job: {{job}}"));
        assert!(template.active);
        assert_eq!(template.variables, vec!["job".to_string()]);

        assert!(repo.exists("ja-1").await.unwrap());
        assert!(!repo.exists("missing").await.unwrap());
        assert!(repo.find("ja-1", ChannelKind::Sms).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_active() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = TemplateRepository::new(db);

        repo.upsert("t", ChannelKind::Push, None, "body", None, Some("title"), None, &[])
            .await
            .unwrap();
        assert_eq!(repo.set_active("t", false).await.unwrap(), 1);

        let template = repo.find("t", ChannelKind::Push).await.unwrap().unwrap();
        assert!(!template.active);
    }
}
