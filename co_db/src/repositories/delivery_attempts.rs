//! ABOUTME: Append-only delivery log, one row per try of one job
//! ABOUTME: Enforces monotone status transitions and idempotent provider callbacks

use crate::Db;
use co_core::{time::now_iso8601, ChannelKind, Error, ErrorKind, Id, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Status of one delivery attempt.
///
/// The permitted sequence is `queued -> sent -> {delivered|bounced|failed}`
/// with `opened`/`clicked`/`dismissed` only after `delivered`. Writes that
/// would regress are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
    Bounced,
    Opened,
    Clicked,
    Dismissed,
    Expired,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Dismissed => "dismissed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "bounced" => Some(Self::Bounced),
            "opened" => Some(Self::Opened),
            "clicked" => Some(Self::Clicked),
            "dismissed" => Some(Self::Dismissed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Position along the monotone sequence
    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Sent => 1,
            Self::Delivered | Self::Failed | Self::Bounced | Self::Expired => 2,
            Self::Opened => 3,
            Self::Clicked => 4,
            Self::Dismissed => 5,
        }
    }

    /// Whether a stored `from` status may advance to `to`.
    ///
    /// Re-applying the same status is permitted so provider callbacks are
    /// idempotent.
    pub fn can_transition(from: AttemptStatus, to: AttemptStatus) -> bool {
        if from == to {
            return true;
        }
        if to.rank() <= from.rank() {
            return false;
        }
        // Engagement statuses require an actual delivery first
        if matches!(to, Self::Opened | Self::Clicked | Self::Dismissed) {
            return matches!(from, Self::Delivered | Self::Opened | Self::Clicked);
        }
        true
    }

    /// Statuses that settle the attempt
    pub fn is_settled(&self) -> bool {
        self.rank() >= 2
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row in the delivery log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub notification_id: String,
    pub job_id: String,
    pub channel: ChannelKind,
    pub attempt_index: u32,
    pub status: AttemptStatus,
    pub provider_message_id: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub attempted_at: String,
    pub settled_at: Option<String>,
}

/// Request to append a delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeliveryAttempt {
    pub notification_id: String,
    pub job_id: String,
    pub channel: ChannelKind,
    pub attempt_index: u32,
    pub status: AttemptStatus,
    pub provider_message_id: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// Repository for the append-only delivery log
#[derive(Clone)]
pub struct DeliveryAttemptRepository {
    db: Db,
}

impl DeliveryAttemptRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append an attempt row.
    ///
    /// `(job_id, attempt_index)` is unique; a duplicate append is surfaced
    /// as a Database error so callers notice double-processing.
    pub async fn append(&self, request: CreateDeliveryAttempt) -> Result<DeliveryAttempt> {
        let id = Id::new().to_string();
        let now = now_iso8601();
        let settled_at = request.status.is_settled().then(|| now.clone());

        debug!(
            job_id = %request.job_id,
            attempt_index = request.attempt_index,
            status = %request.status,
            "Appending delivery attempt"
        );

        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                id, notification_id, job_id, channel, attempt_index, status,
                provider_message_id, error_kind, error_message, attempted_at, settled_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.notification_id)
        .bind(&request.job_id)
        .bind(request.channel.as_str())
        .bind(request.attempt_index)
        .bind(request.status.as_str())
        .bind(&request.provider_message_id)
        .bind(request.error_kind.map(|k| k.as_str()))
        .bind(&request.error_message)
        .bind(&now)
        .bind(&settled_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to append delivery attempt: {}", e)))?;

        Ok(DeliveryAttempt {
            id,
            notification_id: request.notification_id,
            job_id: request.job_id,
            channel: request.channel,
            attempt_index: request.attempt_index,
            status: request.status,
            provider_message_id: request.provider_message_id,
            error_kind: request.error_kind,
            error_message: request.error_message,
            attempted_at: now,
            settled_at,
        })
    }

    /// Advance the status of an attempt identified by `(job_id, attempt_index)`.
    ///
    /// Returns false when the stored status does not permit the transition.
    pub async fn update_status(
        &self,
        job_id: &str,
        attempt_index: u32,
        new_status: AttemptStatus,
        provider_message_id: Option<&str>,
    ) -> Result<bool> {
        let current = self.find_by_job_and_index(job_id, attempt_index).await?;
        let Some(current) = current else {
            warn!(job_id = %job_id, attempt_index, "No attempt row to update");
            return Ok(false);
        };
        self.advance(&current, new_status, provider_message_id).await
    }

    /// Apply a provider callback keyed by provider message id.
    ///
    /// Idempotent: re-applying the delivered status of an already-delivered
    /// attempt reports success without touching the row.
    pub async fn update_status_by_provider_id(
        &self,
        provider_message_id: &str,
        new_status: AttemptStatus,
    ) -> Result<bool> {
        let row = sqlx::query(&format!(
            "{SELECT_ATTEMPT} WHERE provider_message_id = ?"
        ))
        .bind(provider_message_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to look up attempt: {}", e)))?;

        let Some(row) = row else {
            warn!(
                provider_message_id = %provider_message_id,
                "Provider callback for unknown message id"
            );
            return Ok(false);
        };
        let current = row_to_attempt(row)?;
        self.advance(&current, new_status, None).await
    }

    async fn advance(
        &self,
        current: &DeliveryAttempt,
        new_status: AttemptStatus,
        provider_message_id: Option<&str>,
    ) -> Result<bool> {
        if current.status == new_status && provider_message_id.is_none() {
            // Idempotent reapply
            return Ok(true);
        }
        if !AttemptStatus::can_transition(current.status, new_status) {
            warn!(
                job_id = %current.job_id,
                attempt_index = current.attempt_index,
                from = %current.status,
                to = %new_status,
                "Rejected regressing attempt status write"
            );
            return Ok(false);
        }

        let now = now_iso8601();
        let settled_at = new_status.is_settled().then_some(now.as_str());

        // Guard on the previously observed status so concurrent writers
        // serialize per (job_id, attempt_index)
        let result = sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = ?,
                provider_message_id = COALESCE(?, provider_message_id),
                settled_at = COALESCE(settled_at, ?)
            WHERE job_id = ? AND attempt_index = ? AND status = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(provider_message_id)
        .bind(settled_at)
        .bind(&current.job_id)
        .bind(current.attempt_index)
        .bind(current.status.as_str())
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to update attempt status: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Settle an attempt with its final classification.
    ///
    /// Advances the status (monotone-checked) and records the error kind,
    /// message, and provider message id in one write.
    pub async fn settle(
        &self,
        job_id: &str,
        attempt_index: u32,
        status: AttemptStatus,
        error_kind: Option<ErrorKind>,
        error_message: Option<&str>,
        provider_message_id: Option<&str>,
    ) -> Result<bool> {
        let current = self.find_by_job_and_index(job_id, attempt_index).await?;
        let Some(current) = current else {
            warn!(job_id = %job_id, attempt_index, "No attempt row to settle");
            return Ok(false);
        };

        if !AttemptStatus::can_transition(current.status, status) {
            warn!(
                job_id = %job_id,
                attempt_index,
                from = %current.status,
                to = %status,
                "Rejected regressing attempt settle"
            );
            return Ok(false);
        }

        let now = now_iso8601();
        let settled_at = status.is_settled().then_some(now.as_str());

        let result = sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = ?,
                error_kind = COALESCE(?, error_kind),
                error_message = COALESCE(?, error_message),
                provider_message_id = COALESCE(?, provider_message_id),
                settled_at = COALESCE(settled_at, ?)
            WHERE job_id = ? AND attempt_index = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_kind.map(|k| k.as_str()))
        .bind(error_message)
        .bind(provider_message_id)
        .bind(settled_at)
        .bind(job_id)
        .bind(attempt_index)
        .bind(current.status.as_str())
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to settle attempt: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch one attempt row
    pub async fn find_by_job_and_index(
        &self,
        job_id: &str,
        attempt_index: u32,
    ) -> Result<Option<DeliveryAttempt>> {
        let row = sqlx::query(&format!(
            "{SELECT_ATTEMPT} WHERE job_id = ? AND attempt_index = ?"
        ))
        .bind(job_id)
        .bind(attempt_index)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to find attempt: {}", e)))?;

        row.map(row_to_attempt).transpose()
    }

    /// All attempts for a notification, ordered by job then attempt index
    pub async fn list_for_notification(
        &self,
        notification_id: &str,
    ) -> Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ATTEMPT} WHERE notification_id = ? ORDER BY job_id, attempt_index ASC"
        ))
        .bind(notification_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to list attempts: {}", e)))?;

        rows.into_iter().map(row_to_attempt).collect()
    }

    /// Attempt counts grouped by status over a trailing window
    pub async fn stats(&self, hours: i32) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) as count
            FROM delivery_attempts
            WHERE attempted_at >= datetime('now', '-' || ? || ' hours')
            GROUP BY status
            "#,
        )
        .bind(hours)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to get attempt stats: {}", e)))?;

        let mut stats = HashMap::new();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| Error::Database(format!("Failed to get status: {}", e)))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| Error::Database(format!("Failed to get count: {}", e)))?;
            stats.insert(status, count);
        }
        Ok(stats)
    }
}

const SELECT_ATTEMPT: &str = r#"
    SELECT id, notification_id, job_id, channel, attempt_index, status,
           provider_message_id, error_kind, error_message, attempted_at, settled_at
    FROM delivery_attempts
"#;

fn row_to_attempt(row: sqlx::sqlite::SqliteRow) -> Result<DeliveryAttempt> {
    let channel_str: String = row
        .try_get("channel")
        .map_err(|e| Error::Database(format!("Failed to get channel: {}", e)))?;
    let channel = ChannelKind::parse(&channel_str)
        .ok_or_else(|| Error::Database(format!("Unknown channel: {}", channel_str)))?;

    let status_str: String = row
        .try_get("status")
        .map_err(|e| Error::Database(format!("Failed to get status: {}", e)))?;
    let status = AttemptStatus::parse(&status_str)
        .ok_or_else(|| Error::Database(format!("Unknown attempt status: {}", status_str)))?;

    let error_kind: Option<String> = row.try_get("error_kind").ok().flatten();
    let attempt_index: i64 = row
        .try_get("attempt_index")
        .map_err(|e| Error::Database(format!("Failed to get attempt_index: {}", e)))?;

    Ok(DeliveryAttempt {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("Failed to get id: {}", e)))?,
        notification_id: row
            .try_get("notification_id")
            .map_err(|e| Error::Database(format!("Failed to get notification_id: {}", e)))?,
        job_id: row
            .try_get("job_id")
            .map_err(|e| Error::Database(format!("Failed to get job_id: {}", e)))?,
        channel,
        attempt_index: attempt_index as u32,
        status,
        provider_message_id: row.try_get("provider_message_id").ok().flatten(),
        error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
        error_message: row.try_get("error_message").ok().flatten(),
        attempted_at: row
            .try_get("attempted_at")
            .map_err(|e| Error::Database(format!("Failed to get attempted_at: {}", e)))?,
        settled_at: row.try_get("settled_at").ok().flatten(),
    })
}
