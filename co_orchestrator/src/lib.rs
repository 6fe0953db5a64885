//! ABOUTME: Channel orchestrator: accepts notifications, expands per channel
//! ABOUTME: Atomic persistence of notification + jobs; suppressed channels are logged

use co_core::{time::now_epoch_ms, ChannelKind, Error, ErrorKind, Priority, Result};
use co_db::{
    AttemptStatus, CreateDeliveryAttempt, CreateDeliveryJob, CreateNotification, Db,
    DeliveryAttempt, DeliveryAttemptRepository, DeliveryJob, DeliveryJobRepository, JobState,
    NotificationRepository,
};
use co_engine::EngineHandle;
use co_prefs::PreferenceResolver;
use co_template::{RenderedPayload, Renderer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bulk submissions are processed in chunks of this size
const BULK_CHUNK: usize = 500;

/// A logical notification request from a producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub channels: Vec<ChannelKind>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Explicit payload when no template is referenced
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    /// Epoch millis
    #[serde(default)]
    pub scheduled_for: Option<i64>,
    /// Epoch millis
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    /// In-app store-and-forward; on by default
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_priority() -> Priority {
    Priority::Normal
}

fn default_persistent() -> bool {
    true
}

/// Aggregate delivery state of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    InProgress,
    Delivered,
    PartiallyDelivered,
    Failed,
    Expired,
}

/// Per-job view for the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub channel: ChannelKind,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Status response for one notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationStatus {
    pub notification_id: String,
    pub state: AggregateState,
    pub jobs: Vec<JobStatusView>,
    pub attempts: Vec<DeliveryAttempt>,
}

/// The intake component
pub struct Orchestrator {
    db: Db,
    notifications: NotificationRepository,
    jobs: DeliveryJobRepository,
    attempts: DeliveryAttemptRepository,
    resolver: Arc<PreferenceResolver>,
    renderer: Arc<Renderer>,
    engine: EngineHandle,
    max_attempts: u32,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        resolver: Arc<PreferenceResolver>,
        renderer: Arc<Renderer>,
        engine: EngineHandle,
        max_attempts: u32,
    ) -> Self {
        Self {
            notifications: NotificationRepository::new(db.clone()),
            jobs: DeliveryJobRepository::new(db.clone()),
            attempts: DeliveryAttemptRepository::new(db.clone()),
            db,
            resolver,
            renderer,
            engine,
            max_attempts,
        }
    }

    /// Accept a notification: validate, persist, expand, enqueue.
    ///
    /// Returns before any delivery happens. The notification and all of
    /// its jobs are written in one transaction; suppressed channels get a
    /// terminal log entry instead of a job.
    pub async fn submit(&self, request: NotificationRequest) -> Result<String> {
        self.validate(&request).await?;

        let now = now_epoch_ms();
        // A scheduled_for in the past is clamped to now
        let not_before = request.scheduled_for.map(|t| t.max(now)).unwrap_or(now);

        // Preference resolution per requested channel; denied channels
        // produce no job at all
        let mut allowed: Vec<ChannelKind> = Vec::new();
        let mut suppressed: Vec<(ChannelKind, &'static str)> = Vec::new();
        for &channel in &request.channels {
            let decision = self
                .resolver
                .resolve(&request.user_id, &request.kind, channel)
                .await?;
            if decision.allowed {
                allowed.push(channel);
            } else {
                let reason = decision
                    .reason
                    .map(|r| r.as_str())
                    .unwrap_or("preference denied");
                suppressed.push((channel, reason));
            }
        }

        // Render at intake where possible; unresolvable renders defer to
        // the engine (payload stays NULL on the job)
        let mut payloads: HashMap<ChannelKind, RenderedPayload> = HashMap::new();
        for &channel in &allowed {
            let rendered = match (&request.template_id, &request.payload) {
                (Some(template_id), _) => {
                    match self
                        .renderer
                        .render(template_id, channel, &request.variables)
                        .await
                    {
                        Ok(rendered) => Some(rendered),
                        Err(Error::TemplateNotFound(_)) | Err(Error::TemplateInactive(_)) => {
                            warn!(
                                template_id = %template_id,
                                channel = %channel,
                                "No usable template variant for channel, deferring render"
                            );
                            None
                        }
                        Err(e) => return Err(e),
                    }
                }
                (None, Some(payload)) => Some(RenderedPayload::from_explicit(channel, payload)?),
                (None, None) => None,
            };
            if let Some(rendered) = rendered {
                payloads.insert(channel, rendered);
            }
        }

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let notification = NotificationRepository::insert_in_tx(
            &mut tx,
            CreateNotification {
                user_id: request.user_id.clone(),
                kind: request.kind.clone(),
                priority: request.priority,
                channels: request.channels.clone(),
                template_id: request.template_id.clone(),
                variables: request.variables.clone(),
                payload: request.payload.clone(),
                scheduled_for: request.scheduled_for.map(|t| t.max(now)),
                expires_at: request.expires_at,
                metadata: request.metadata.clone(),
            },
        )
        .await?;

        for &channel in &allowed {
            let payload = payloads
                .get(&channel)
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| Error::Internal(format!("Payload serialization failed: {}", e)))?;

            DeliveryJobRepository::insert_in_tx(
                &mut tx,
                CreateDeliveryJob {
                    notification_id: notification.id.clone(),
                    user_id: request.user_id.clone(),
                    kind: request.kind.clone(),
                    channel,
                    priority: request.priority,
                    payload,
                    max_attempts: self.max_attempts,
                    not_before,
                    expires_at: request.expires_at,
                    persistent: request.persistent,
                },
            )
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit submission: {}", e)))?;

        // Terminal log entries for the suppressed channels; no job exists,
        // so the synthetic row uses index 0 under a derived job id
        for (channel, reason) in &suppressed {
            let append = self
                .attempts
                .append(CreateDeliveryAttempt {
                    notification_id: notification.id.clone(),
                    job_id: format!("{}-{}", notification.id, channel.as_str()),
                    channel: *channel,
                    attempt_index: 0,
                    status: AttemptStatus::Expired,
                    provider_message_id: None,
                    error_kind: Some(ErrorKind::Suppressed),
                    error_message: Some(reason.to_string()),
                })
                .await;
            if let Err(e) = append {
                warn!(
                    notification_id = %notification.id,
                    channel = %channel,
                    error = %e,
                    "Failed to log suppressed channel"
                );
            }
        }

        self.engine.nudge();

        info!(
            notification_id = %notification.id,
            user_id = %request.user_id,
            kind = %request.kind,
            jobs = allowed.len(),
            suppressed = suppressed.len(),
            "Notification accepted"
        );

        Ok(notification.id)
    }

    /// Submit a list; per-item failures do not abort the batch
    pub async fn submit_bulk(
        &self,
        requests: Vec<NotificationRequest>,
    ) -> Vec<Result<String>> {
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(BULK_CHUNK) {
            for request in chunk {
                results.push(self.submit(request.clone()).await);
            }
        }
        results
    }

    /// Best-effort cancel: pending jobs expire; in-flight jobs finish
    pub async fn cancel(&self, notification_id: &str) -> Result<usize> {
        let expired = self
            .jobs
            .expire_pending_for_notification(notification_id)
            .await?;

        for job in &expired {
            let append = self
                .attempts
                .append(CreateDeliveryAttempt {
                    notification_id: notification_id.to_string(),
                    job_id: job.id.clone(),
                    channel: job.channel,
                    attempt_index: job.attempts + 1,
                    status: AttemptStatus::Expired,
                    provider_message_id: None,
                    error_kind: None,
                    error_message: Some("cancelled".to_string()),
                })
                .await;
            if let Err(e) = append {
                warn!(job_id = %job.id, error = %e, "Failed to log cancellation");
            }
        }

        debug!(
            notification_id = %notification_id,
            cancelled = expired.len(),
            "Cancellation applied"
        );
        Ok(expired.len())
    }

    /// Latest state plus per-channel attempts, for the status endpoint
    pub async fn status(&self, notification_id: &str) -> Result<NotificationStatus> {
        let notification = self
            .notifications
            .find_by_id(notification_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("notification {}", notification_id)))?;

        let jobs = self.jobs.list_for_notification(&notification.id).await?;
        let attempts = self.attempts.list_for_notification(&notification.id).await?;

        let state = aggregate_state(&jobs);

        Ok(NotificationStatus {
            notification_id: notification.id,
            state,
            jobs: jobs
                .into_iter()
                .map(|job| JobStatusView {
                    job_id: job.id,
                    channel: job.channel,
                    state: job.state,
                    attempts: job.attempts,
                    last_error: job.last_error,
                })
                .collect(),
            attempts,
        })
    }

    async fn validate(&self, request: &NotificationRequest) -> Result<()> {
        if request.user_id.trim().is_empty() {
            return Err(Error::InvalidInput("user_id must not be empty".to_string()));
        }
        if request.channels.is_empty() {
            return Err(Error::InvalidInput(
                "at least one channel is required".to_string(),
            ));
        }
        if request.template_id.is_none() && request.payload.is_none() {
            return Err(Error::InvalidInput(
                "either template_id or payload is required".to_string(),
            ));
        }
        if let Some(expires_at) = request.expires_at {
            if expires_at <= now_epoch_ms() {
                return Err(Error::InvalidInput(
                    "expires_at must be in the future".to_string(),
                ));
            }
        }
        if let Some(template_id) = &request.template_id {
            if !self.renderer.template_exists(template_id).await? {
                return Err(Error::TemplateNotFound(template_id.clone()));
            }
        }
        Ok(())
    }
}

/// Roll jobs up into the aggregate notification state
fn aggregate_state(jobs: &[DeliveryJob]) -> AggregateState {
    if jobs.is_empty() {
        // Every channel was suppressed at intake
        return AggregateState::Expired;
    }
    if jobs.iter().any(|j| !j.state.is_terminal()) {
        return AggregateState::InProgress;
    }

    let succeeded = jobs.iter().filter(|j| j.state == JobState::Succeeded).count();
    let expired = jobs.iter().filter(|j| j.state == JobState::Expired).count();

    if succeeded == 0 && expired == jobs.len() {
        AggregateState::Expired
    } else if succeeded == 0 {
        AggregateState::Failed
    } else if succeeded + expired == jobs.len() {
        AggregateState::Delivered
    } else {
        AggregateState::PartiallyDelivered
    }
}
