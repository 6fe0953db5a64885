//! ABOUTME: Repository for per-channel delivery jobs, the unit the engine processes
//! ABOUTME: Owns the job state machine: claims, leases, retries, dead-lettering

use crate::Db;
use co_core::{time::now_iso8601, ChannelKind, Error, Id, Priority, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use tracing::{debug, warn};

/// State of a delivery job.
///
/// `succeeded`, `dead_lettered`, and `expired` are absorbing; every
/// transition into or out of a state is guarded by a conditional UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    DeadLettered,
    Expired,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "dead_lettered" => Some(Self::DeadLettered),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered | Self::Expired)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery job: a (notification, channel) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: String,
    pub notification_id: String,
    pub user_id: String,
    /// Notification kind, denormalized for preference re-resolution
    pub kind: String,
    pub channel: ChannelKind,
    pub priority: Priority,
    /// Rendered payload, when rendering happened at intake
    pub payload: Option<serde_json::Value>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Epoch millis, earliest attempt instant
    pub not_before: i64,
    /// Epoch millis; the job expires unattempted past this instant
    pub expires_at: Option<i64>,
    /// In-app: force store-and-forward even with live sessions
    pub persistent: bool,
    pub state: JobState,
    pub lease_expires_at: Option<i64>,
    pub leased_by: Option<String>,
    pub internal_failures: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Request to create a delivery job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeliveryJob {
    pub notification_id: String,
    pub user_id: String,
    pub kind: String,
    pub channel: ChannelKind,
    pub priority: Priority,
    pub payload: Option<serde_json::Value>,
    pub max_attempts: u32,
    pub not_before: i64,
    pub expires_at: Option<i64>,
    pub persistent: bool,
}

/// Repository for delivery jobs
#[derive(Clone)]
pub struct DeliveryJobRepository {
    db: Db,
}

const TERMINAL_STATES: &str = "('succeeded', 'dead_lettered', 'expired')";

impl DeliveryJobRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a job inside an open transaction (intake path)
    pub async fn insert_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        request: CreateDeliveryJob,
    ) -> Result<DeliveryJob> {
        let id = Id::new().to_string();
        let now = now_iso8601();

        let payload_json = request
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Database(format!("Failed to serialize payload: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO delivery_jobs (
                id, notification_id, user_id, kind, channel, priority, payload,
                attempts, max_attempts, not_before, expires_at, persistent,
                state, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.notification_id)
        .bind(&request.user_id)
        .bind(&request.kind)
        .bind(request.channel.as_str())
        .bind(request.priority.as_str())
        .bind(&payload_json)
        .bind(request.max_attempts)
        .bind(request.not_before)
        .bind(request.expires_at)
        .bind(request.persistent)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to create delivery job: {}", e)))?;

        Ok(DeliveryJob {
            id,
            notification_id: request.notification_id,
            user_id: request.user_id,
            kind: request.kind,
            channel: request.channel,
            priority: request.priority,
            payload: request.payload,
            attempts: 0,
            max_attempts: request.max_attempts,
            not_before: request.not_before,
            expires_at: request.expires_at,
            persistent: request.persistent,
            state: JobState::Pending,
            lease_expires_at: None,
            leased_by: None,
            internal_failures: 0,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Find a job by id
    pub async fn find_by_id(&self, id: &str) -> Result<Option<DeliveryJob>> {
        let row = sqlx::query(SELECT_JOB)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to find job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// All jobs for a notification, in creation order
    pub async fn list_for_notification(&self, notification_id: &str) -> Result<Vec<DeliveryJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, notification_id, user_id, kind, channel, priority, payload, attempts,
                   max_attempts, not_before, expires_at, persistent, state, lease_expires_at, leased_by,
                   internal_failures, last_error, created_at, updated_at
            FROM delivery_jobs
            WHERE notification_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to list jobs: {}", e)))?;

        rows.into_iter().map(row_to_job).collect()
    }

    /// Atomically claim due pending jobs for a channel.
    ///
    /// Claimed jobs move to `in_flight` with a lease; another worker may
    /// reclaim them once the lease expires. Dequeue order is priority tier
    /// first, then `not_before`.
    pub async fn claim_due(
        &self,
        channel: ChannelKind,
        limit: i64,
        now_ms: i64,
        lease_ms: i64,
        worker: &str,
    ) -> Result<Vec<DeliveryJob>> {
        let now = now_iso8601();
        let lease_expires_at = now_ms + lease_ms;

        let rows = sqlx::query(&format!(
            r#"
            UPDATE delivery_jobs
            SET state = 'in_flight', lease_expires_at = ?, leased_by = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE channel = ? AND state = 'pending' AND not_before <= ?
                ORDER BY
                    CASE priority
                        WHEN 'urgent' THEN 0
                        WHEN 'high' THEN 1
                        WHEN 'normal' THEN 2
                        ELSE 3
                    END,
                    not_before ASC,
                    id ASC
                LIMIT ?
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(lease_expires_at)
        .bind(worker)
        .bind(&now)
        .bind(channel.as_str())
        .bind(now_ms)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to claim jobs: {}", e)))?;

        rows.into_iter().map(row_to_job).collect()
    }

    /// Mark a job succeeded. No-op on jobs already terminal.
    pub async fn mark_succeeded(&self, id: &str) -> Result<bool> {
        self.transition(id, JobState::Succeeded, None).await
    }

    /// Mark a job dead-lettered with its final error
    pub async fn mark_dead_lettered(&self, id: &str, error: &str) -> Result<bool> {
        self.transition(id, JobState::DeadLettered, Some(error)).await
    }

    /// Expire a job (suppression at dispatch, notification expiry)
    pub async fn mark_expired(&self, id: &str, reason: &str) -> Result<bool> {
        self.transition(id, JobState::Expired, Some(reason)).await
    }

    async fn transition(&self, id: &str, to: JobState, error: Option<&str>) -> Result<bool> {
        let now = now_iso8601();
        let result = sqlx::query(&format!(
            r#"
            UPDATE delivery_jobs
            SET state = ?, last_error = COALESCE(?, last_error),
                lease_expires_at = NULL, leased_by = NULL, updated_at = ?
            WHERE id = ? AND state NOT IN {TERMINAL_STATES}
            "#
        ))
        .bind(to.as_str())
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to transition job: {}", e)))?;

        if result.rows_affected() == 0 {
            warn!(job_id = %id, to = %to, "Job transition skipped (already terminal or missing)");
        }
        Ok(result.rows_affected() > 0)
    }

    /// Count an attempt and schedule the next one after a backoff delay
    pub async fn schedule_retry(&self, id: &str, not_before: i64, error: &str) -> Result<bool> {
        let now = now_iso8601();
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'pending', attempts = attempts + 1, not_before = ?,
                last_error = ?, lease_expires_at = NULL, leased_by = NULL, updated_at = ?
            WHERE id = ? AND state = 'in_flight' AND attempts < max_attempts
            "#,
        )
        .bind(not_before)
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to schedule retry: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Count the attempt that just ran, leaving the job in flight.
    ///
    /// Used before a terminal settle so `attempts` reflects reality even
    /// when no retry follows.
    pub async fn count_attempt(&self, id: &str) -> Result<()> {
        let now = now_iso8601();
        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET attempts = attempts + 1, updated_at = ?
            WHERE id = ? AND attempts < max_attempts
            "#,
        )
        .bind(&now)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to count attempt: {}", e)))?;
        Ok(())
    }

    /// Return a job to pending without counting an attempt (rate-limit defer)
    pub async fn defer(&self, id: &str, not_before: i64) -> Result<bool> {
        let now = now_iso8601();
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'pending', not_before = ?, lease_expires_at = NULL,
                leased_by = NULL, updated_at = ?
            WHERE id = ? AND state = 'in_flight'
            "#,
        )
        .bind(not_before)
        .bind(&now)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to defer job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Expire the pending jobs of a notification (best-effort cancel).
    ///
    /// In-flight and terminal jobs are untouched; returns the expired jobs.
    pub async fn expire_pending_for_notification(
        &self,
        notification_id: &str,
    ) -> Result<Vec<DeliveryJob>> {
        let now = now_iso8601();
        let rows = sqlx::query(&format!(
            r#"
            UPDATE delivery_jobs
            SET state = 'expired', lease_expires_at = NULL, leased_by = NULL, updated_at = ?
            WHERE notification_id = ? AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&now)
        .bind(notification_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to expire jobs: {}", e)))?;

        rows.into_iter().map(row_to_job).collect()
    }

    /// Record an internal failure; returns the consecutive count.
    ///
    /// The engine dead-letters on the second consecutive internal failure.
    pub async fn record_internal_failure(&self, id: &str) -> Result<u32> {
        let now = now_iso8601();
        let row = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET internal_failures = internal_failures + 1, state = 'pending',
                lease_expires_at = NULL, leased_by = NULL, updated_at = ?
            WHERE id = ? AND state = 'in_flight'
            RETURNING internal_failures
            "#,
        )
        .bind(&now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to record internal failure: {}", e)))?;

        match row {
            Some(row) => {
                let count: i64 = row
                    .try_get("internal_failures")
                    .map_err(|e| Error::Database(format!("Failed to get count: {}", e)))?;
                Ok(count as u32)
            }
            None => Ok(0),
        }
    }

    /// Clear the consecutive internal-failure counter after a clean run
    pub async fn clear_internal_failures(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE delivery_jobs SET internal_failures = 0 WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("Failed to clear failures: {}", e)))?;
        Ok(())
    }

    /// Return expired in-flight leases to pending; crash liveness.
    pub async fn reclaim_expired_leases(&self, now_ms: i64) -> Result<u64> {
        let now = now_iso8601();
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'pending', lease_expires_at = NULL, leased_by = NULL, updated_at = ?
            WHERE state = 'in_flight' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?
            "#,
        )
        .bind(&now)
        .bind(now_ms)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to reclaim leases: {}", e)))?;

        if result.rows_affected() > 0 {
            debug!(count = result.rows_affected(), "Reclaimed expired job leases");
        }
        Ok(result.rows_affected())
    }

    /// Release the in-flight jobs of a draining worker back to pending
    pub async fn release_in_flight(&self, worker: &str) -> Result<u64> {
        let now = now_iso8601();
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'pending', lease_expires_at = NULL, leased_by = NULL, updated_at = ?
            WHERE state = 'in_flight' AND leased_by = ?
            "#,
        )
        .bind(&now)
        .bind(worker)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to release in-flight jobs: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Queue depth (pending jobs) per channel
    pub async fn pending_counts(&self) -> Result<HashMap<ChannelKind, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT channel, COUNT(*) as count
            FROM delivery_jobs
            WHERE state = 'pending'
            GROUP BY channel
            "#,
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to count pending jobs: {}", e)))?;

        let mut counts = HashMap::new();
        for row in rows {
            let channel: String = row
                .try_get("channel")
                .map_err(|e| Error::Database(format!("Failed to get channel: {}", e)))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| Error::Database(format!("Failed to get count: {}", e)))?;
            if let Some(kind) = ChannelKind::parse(&channel) {
                counts.insert(kind, count);
            }
        }
        Ok(counts)
    }
}

const SELECT_JOB: &str = r#"
    SELECT id, notification_id, user_id, kind, channel, priority, payload, attempts,
           max_attempts, not_before, expires_at, persistent, state, lease_expires_at, leased_by,
           internal_failures, last_error, created_at, updated_at
    FROM delivery_jobs
    WHERE id = ?
"#;

const JOB_COLUMNS: &str = "id, notification_id, user_id, kind, channel, priority, payload, attempts, \
     max_attempts, not_before, expires_at, persistent, state, lease_expires_at, leased_by, \
     internal_failures, last_error, created_at, updated_at";

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<DeliveryJob> {
    let channel_str: String = row
        .try_get("channel")
        .map_err(|e| Error::Database(format!("Failed to get channel: {}", e)))?;
    let channel = ChannelKind::parse(&channel_str)
        .ok_or_else(|| Error::Database(format!("Unknown channel: {}", channel_str)))?;

    let priority_str: String = row
        .try_get("priority")
        .map_err(|e| Error::Database(format!("Failed to get priority: {}", e)))?;
    let priority = Priority::parse(&priority_str)
        .ok_or_else(|| Error::Database(format!("Unknown priority: {}", priority_str)))?;

    let state_str: String = row
        .try_get("state")
        .map_err(|e| Error::Database(format!("Failed to get state: {}", e)))?;
    let state = JobState::parse(&state_str)
        .ok_or_else(|| Error::Database(format!("Unknown job state: {}", state_str)))?;

    let payload_json: Option<String> = row.try_get("payload").ok().flatten();
    let payload = payload_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| Error::Database(format!("Failed to deserialize payload: {}", e)))?;

    let attempts: i64 = row
        .try_get("attempts")
        .map_err(|e| Error::Database(format!("Failed to get attempts: {}", e)))?;
    let max_attempts: i64 = row
        .try_get("max_attempts")
        .map_err(|e| Error::Database(format!("Failed to get max_attempts: {}", e)))?;
    let internal_failures: i64 = row
        .try_get("internal_failures")
        .map_err(|e| Error::Database(format!("Failed to get internal_failures: {}", e)))?;

    Ok(DeliveryJob {
        id: row
            .try_get("id")
            .map_err(|e| Error::Database(format!("Failed to get id: {}", e)))?,
        notification_id: row
            .try_get("notification_id")
            .map_err(|e| Error::Database(format!("Failed to get notification_id: {}", e)))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| Error::Database(format!("Failed to get user_id: {}", e)))?,
        kind: row
            .try_get("kind")
            .map_err(|e| Error::Database(format!("Failed to get kind: {}", e)))?,
        channel,
        priority,
        payload,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        not_before: row
            .try_get("not_before")
            .map_err(|e| Error::Database(format!("Failed to get not_before: {}", e)))?,
        expires_at: row.try_get("expires_at").ok().flatten(),
        persistent: row
            .try_get("persistent")
            .map_err(|e| Error::Database(format!("Failed to get persistent: {}", e)))?,
        state,
        lease_expires_at: row.try_get("lease_expires_at").ok().flatten(),
        leased_by: row.try_get("leased_by").ok().flatten(),
        internal_failures: internal_failures as u32,
        last_error: row.try_get("last_error").ok().flatten(),
        created_at: row
            .try_get("created_at")
            .map_err(|e| Error::Database(format!("Failed to get created_at: {}", e)))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| Error::Database(format!("Failed to get updated_at: {}", e)))?,
    })
}
