//! ABOUTME: The delivery engine proper: channel pumps, dispatch, settlement
//! ABOUTME: At-least-once via leases; terminal log writes precede job settle

use crate::backoff::retry_delay;
use crate::batcher::Batcher;
use crate::metrics::EngineMetrics;
use crate::rate_limit::{SlidingWindow, UserRateLimiter};
use co_channels::{AdapterSet, DeliveryItem, SendOutcome, TokenOutcome, TokenSendStatus};
use co_config::{AdapterConfig, Config, DrainConfig, QueueConfig, RateConfig, RetryConfig};
use co_core::{time::now_epoch_ms, ChannelKind, Error, ErrorKind, Priority, Result};
use co_db::{
    AttemptStatus, CreateDeliveryAttempt, Db, DeliveryAttemptRepository, DeliveryJob,
    DeliveryJobRepository, DeviceTokenRepository, InboxItemRepository, NotificationRepository,
};
use co_prefs::PreferenceResolver;
use co_template::{RenderedPayload, Renderer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How many due jobs one pump iteration claims at most
const CLAIM_CHUNK: i64 = 256;

/// Engine configuration, bundled from the application config
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub rate: RateConfig,
    pub adapter: AdapterConfig,
    pub drain: DrainConfig,
    /// Pump wakeup interval when idle
    pub poll_interval: Duration,
    /// Sweeper cadence for inbox expiry and token purges
    pub sweep_interval: Duration,
    /// Inbox retention for the purge sweep
    pub inbox_retention_days: u32,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            queue: config.queue.clone(),
            retry: config.retry.clone(),
            rate: config.rate.clone(),
            adapter: config.adapter.clone(),
            drain: config.drain.clone(),
            poll_interval: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(60),
            inbox_retention_days: config.inbox.retention_days,
        }
    }
}

/// Narrow handle passed to the orchestrator: enqueue-side wakeup only.
///
/// The orchestrator persists jobs itself; nudging just shortens the
/// pump poll latency. Adapters hold no engine references at all.
#[derive(Clone)]
pub struct EngineHandle {
    wake: Arc<Notify>,
}

impl EngineHandle {
    pub fn nudge(&self) {
        self.wake.notify_waiters();
    }
}

/// The delivery engine
pub struct DeliveryEngine {
    jobs: DeliveryJobRepository,
    attempts: DeliveryAttemptRepository,
    notifications: NotificationRepository,
    inbox: InboxItemRepository,
    tokens: DeviceTokenRepository,
    resolver: Arc<PreferenceResolver>,
    renderer: Arc<Renderer>,
    adapters: AdapterSet,
    settings: EngineSettings,
    windows: HashMap<ChannelKind, SlidingWindow>,
    user_window: UserRateLimiter,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
    background: TaskTracker,
    dispatch: TaskTracker,
    worker_id: String,
}

impl DeliveryEngine {
    pub fn new(
        db: Db,
        resolver: Arc<PreferenceResolver>,
        renderer: Arc<Renderer>,
        adapters: AdapterSet,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let mut windows = HashMap::new();
        for channel in [ChannelKind::Email, ChannelKind::Sms, ChannelKind::Push] {
            windows.insert(channel, SlidingWindow::per_minute(settings.rate.per_min(channel)));
        }
        let user_window = UserRateLimiter::per_minute(settings.rate.in_app_per_user_per_min);

        let worker_id = format!(
            "{}-{}",
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "courier".to_string()),
            std::process::id()
        );

        Arc::new(Self {
            jobs: DeliveryJobRepository::new(db.clone()),
            attempts: DeliveryAttemptRepository::new(db.clone()),
            notifications: NotificationRepository::new(db.clone()),
            inbox: InboxItemRepository::new(db.clone()),
            tokens: DeviceTokenRepository::new(db),
            resolver,
            renderer,
            adapters,
            settings,
            windows,
            user_window,
            metrics: Arc::new(EngineMetrics::new()),
            shutdown: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            background: TaskTracker::new(),
            dispatch: TaskTracker::new(),
            worker_id,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            wake: self.wake.clone(),
        }
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Spawn the channel pumps and maintenance tasks
    pub fn start(self: &Arc<Self>) {
        info!(worker_id = %self.worker_id, "Starting delivery engine");

        for channel in ChannelKind::ALL {
            let engine = self.clone();
            self.background
                .spawn(async move { engine.run_channel_pump(channel).await });
        }

        let engine = self.clone();
        self.background
            .spawn(async move { engine.run_reclaimer().await });

        let engine = self.clone();
        self.background
            .spawn(async move { engine.run_sweeper().await });

        let engine = self.clone();
        self.background
            .spawn(async move { engine.run_depth_sampler().await });
    }

    /// Drain protocol: stop claiming, flush batches, await in-flight up
    /// to the drain timeout, then release anything unfinished.
    pub async fn shutdown(&self) {
        info!("Delivery engine draining");
        self.shutdown.cancel();

        self.background.close();
        self.background.wait().await;

        self.dispatch.close();
        let drained = tokio::time::timeout(
            Duration::from_millis(self.settings.drain.timeout_ms),
            self.dispatch.wait(),
        )
        .await
        .is_ok();

        if !drained {
            warn!("Drain timeout elapsed with dispatches still running");
        }

        match self.jobs.release_in_flight(&self.worker_id).await {
            Ok(released) if released > 0 => {
                info!(released, "Released unfinished in-flight jobs back to pending");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to release in-flight jobs"),
        }

        info!("Delivery engine stopped");
    }

    async fn run_channel_pump(self: Arc<Self>, channel: ChannelKind) {
        let concurrency = self.settings.queue.concurrency(channel);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut batchers: HashMap<Priority, Batcher> = [Priority::Normal, Priority::Low]
            .into_iter()
            .map(|priority| {
                (
                    priority,
                    Batcher::new(self.settings.queue.batch_policy(channel, priority)),
                )
            })
            .collect();

        // Leases must outlive the longest batching residence plus the
        // adapter call
        let lease_ms = self.settings.adapter.visibility_timeout().as_millis() as i64
            + self
                .settings
                .queue
                .batch_policy(channel, Priority::Low)
                .flush_after
                .as_millis() as i64;

        debug!(channel = %channel, concurrency, "Channel pump started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self
                .jobs
                .claim_due(channel, CLAIM_CHUNK, now_epoch_ms(), lease_ms, &self.worker_id)
                .await
            {
                Ok(claimed) => {
                    let now = Instant::now();
                    for job in claimed {
                        if job.priority.bypasses_batching() || channel == ChannelKind::InApp {
                            self.spawn_dispatch(channel, vec![job], 1, semaphore.clone());
                            continue;
                        }
                        let batcher = batchers
                            .get_mut(&job.priority)
                            .expect("batchers for normal and low");
                        let cap = batcher.capacity();
                        if let Some(batch) = batcher.push(job, now) {
                            self.spawn_dispatch(channel, batch, cap, semaphore.clone());
                        }
                    }
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "Failed to claim jobs");
                }
            }

            // Timer input for the partial batches
            let now = Instant::now();
            for batcher in batchers.values_mut() {
                let cap = batcher.capacity();
                if let Some(batch) = batcher.flush_due(now) {
                    self.spawn_dispatch(channel, batch, cap, semaphore.clone());
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        // Shutdown: flush whatever is collecting
        for batcher in batchers.values_mut() {
            let cap = batcher.capacity();
            if let Some(batch) = batcher.flush_all() {
                self.spawn_dispatch(channel, batch, cap, semaphore.clone());
            }
        }

        debug!(channel = %channel, "Channel pump stopped");
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        channel: ChannelKind,
        batch: Vec<DeliveryJob>,
        capacity: usize,
        semaphore: Arc<Semaphore>,
    ) {
        let engine = self.clone();
        self.dispatch.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let metrics = engine.metrics.channel(channel);
            metrics.active_workers.inc();
            engine.process_batch(channel, batch, capacity).await;
            engine.metrics.channel(channel).active_workers.dec();
        });
    }

    async fn process_batch(&self, channel: ChannelKind, batch: Vec<DeliveryJob>, capacity: usize) {
        let timer = Instant::now();
        let metrics = self.metrics.channel(channel);

        // Rate limiting: in-app windows are per user, others per channel.
        // Deferral reinserts the jobs without counting an attempt.
        let window_check = if channel == ChannelKind::InApp {
            self.user_window.try_acquire(&batch[0].user_id, batch.len())
        } else {
            self.windows
                .get(&channel)
                .expect("window per provider channel")
                .try_acquire(batch.len())
        };

        if let Err(retry_after) = window_check {
            let not_before = now_epoch_ms() + retry_after.as_millis() as i64;
            debug!(
                channel = %channel,
                batch = batch.len(),
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate window exhausted, deferring batch"
            );
            for job in &batch {
                if let Err(e) = self.jobs.defer(&job.id, not_before).await {
                    error!(job_id = %job.id, error = %e, "Failed to defer job");
                }
            }
            metrics.deferred.inc();
            return;
        }

        metrics
            .batch_fill_ratio
            .observe(batch.len() as f64 / capacity.max(1) as f64);

        let mut live: Vec<(DeliveryJob, DeliveryItem)> = Vec::with_capacity(batch.len());
        for job in batch {
            match self.prepare_item(channel, &job).await {
                Ok(Some(item)) => live.push((job, item)),
                Ok(None) => {}
                Err(e) => self.internal_failure(&job, &e).await,
            }
        }

        if live.is_empty() {
            metrics.dispatch_seconds.observe(timer.elapsed().as_secs_f64());
            return;
        }

        let Some(adapter) = self.adapters.get(channel) else {
            let err = Error::Internal(format!("No adapter registered for {}", channel));
            for (job, _) in &live {
                self.internal_failure(job, &err).await;
            }
            return;
        };

        let items: Vec<DeliveryItem> = live.iter().map(|(_, item)| item.clone()).collect();
        let outcomes =
            match tokio::time::timeout(self.settings.adapter.timeout(), adapter.send(&items)).await
            {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    warn!(channel = %channel, "Adapter call timed out");
                    items
                        .iter()
                        .map(|_| SendOutcome::retryable("adapter timeout"))
                        .collect()
                }
            };

        if outcomes.len() != live.len() {
            let err = Error::Internal(format!(
                "Adapter returned {} outcomes for {} items",
                outcomes.len(),
                live.len()
            ));
            for (job, _) in &live {
                self.internal_failure(job, &err).await;
            }
            return;
        }

        for ((job, item), outcome) in live.into_iter().zip(outcomes) {
            if let Err(e) = self
                .handle_outcome(channel, &job, item.attempt_index, outcome)
                .await
            {
                self.internal_failure(&job, &e).await;
            }
        }

        metrics.dispatch_seconds.observe(timer.elapsed().as_secs_f64());
    }

    /// Pre-send checks and item construction. Returns None when the job
    /// settled without an adapter call (expired, suppressed, bad template).
    async fn prepare_item(
        &self,
        channel: ChannelKind,
        job: &DeliveryJob,
    ) -> Result<Option<DeliveryItem>> {
        let attempt_index = job.attempts + 1;

        if let Some(expires_at) = job.expires_at {
            if expires_at < now_epoch_ms() {
                self.append_attempt(job, attempt_index, AttemptStatus::Expired, None, Some("notification expired"), None)
                    .await?;
                self.jobs.mark_expired(&job.id, "notification expired").await?;
                return Ok(None);
            }
        }

        // Re-resolve at dispatch time: a long-queued job must honor the
        // user's current preferences
        let decision = self
            .resolver
            .resolve(&job.user_id, &job.kind, channel)
            .await?;
        if !decision.allowed {
            let reason = decision
                .reason
                .map(|r| r.as_str())
                .unwrap_or("preference denied");
            self.append_attempt(
                job,
                attempt_index,
                AttemptStatus::Expired,
                Some(ErrorKind::Suppressed),
                Some(reason),
                None,
            )
            .await?;
            self.jobs.mark_expired(&job.id, reason).await?;
            return Ok(None);
        }

        let payload = match self.resolve_payload(channel, job).await {
            Ok(payload) => payload,
            Err(Error::TemplateNotFound(id)) | Err(Error::TemplateInactive(id)) => {
                let message = format!("Template unusable: {}", id);
                self.append_attempt(
                    job,
                    attempt_index,
                    AttemptStatus::Failed,
                    Some(ErrorKind::Permanent),
                    Some(&message),
                    None,
                )
                .await?;
                self.jobs.count_attempt(&job.id).await?;
                self.jobs.mark_dead_lettered(&job.id, &message).await?;
                self.metrics.channel(channel).dead_lettered.inc();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.append_attempt(job, attempt_index, AttemptStatus::Queued, None, None, None)
            .await?;

        Ok(Some(DeliveryItem {
            job_id: job.id.clone(),
            notification_id: job.notification_id.clone(),
            user_id: job.user_id.clone(),
            kind: job.kind.clone(),
            attempt_index,
            priority: job.priority,
            payload,
            handle: decision.handle,
            persistent: job.persistent,
            expires_at: job.expires_at,
        }))
    }

    async fn resolve_payload(
        &self,
        channel: ChannelKind,
        job: &DeliveryJob,
    ) -> Result<RenderedPayload> {
        if let Some(value) = &job.payload {
            return serde_json::from_value(value.clone())
                .map_err(|e| Error::Internal(format!("Stored payload unreadable: {}", e)));
        }

        // Deferred rendering: resolve through the notification
        let notification = self
            .notifications
            .find_by_id(&job.notification_id)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("Notification {} missing", job.notification_id))
            })?;

        match (&notification.template_id, &notification.payload) {
            (Some(template_id), _) => {
                self.renderer
                    .render(template_id, channel, &notification.variables)
                    .await
            }
            (None, Some(payload)) => RenderedPayload::from_explicit(channel, payload),
            (None, None) => Err(Error::Internal(format!(
                "Job {} has neither payload nor template",
                job.id
            ))),
        }
    }

    async fn handle_outcome(
        &self,
        channel: ChannelKind,
        job: &DeliveryJob,
        attempt_index: u32,
        outcome: SendOutcome,
    ) -> Result<()> {
        let metrics = self.metrics.channel(channel);

        match outcome {
            SendOutcome::Accepted {
                provider_message_id,
            } => {
                self.attempts
                    .settle(
                        &job.id,
                        attempt_index,
                        AttemptStatus::Sent,
                        None,
                        None,
                        provider_message_id.as_deref(),
                    )
                    .await?;
                // In-app has no provider callback; fan-out or inbox write
                // is the delivery
                if channel == ChannelKind::InApp {
                    self.attempts
                        .settle(&job.id, attempt_index, AttemptStatus::Delivered, None, None, None)
                        .await?;
                    metrics.delivered.inc();
                }
                self.jobs.count_attempt(&job.id).await?;
                self.jobs.mark_succeeded(&job.id).await?;
                self.jobs.clear_internal_failures(&job.id).await?;
                metrics.sent.inc();
                debug!(job_id = %job.id, channel = %channel, "Job delivered to provider");
            }
            SendOutcome::Retryable { message } => {
                self.settle_retryable(channel, job, attempt_index, &message).await?;
            }
            SendOutcome::Permanent { kind, message } => {
                if kind == ErrorKind::Suppressed {
                    self.attempts
                        .settle(
                            &job.id,
                            attempt_index,
                            AttemptStatus::Expired,
                            Some(ErrorKind::Suppressed),
                            Some(&message),
                            None,
                        )
                        .await?;
                    self.jobs.count_attempt(&job.id).await?;
                    self.jobs.mark_expired(&job.id, &message).await?;
                } else {
                    self.attempts
                        .settle(
                            &job.id,
                            attempt_index,
                            AttemptStatus::Failed,
                            Some(kind),
                            Some(&message),
                            None,
                        )
                        .await?;
                    self.jobs.count_attempt(&job.id).await?;
                    self.jobs.mark_dead_lettered(&job.id, &message).await?;
                    metrics.failed.inc();
                    metrics.dead_lettered.inc();
                    warn!(job_id = %job.id, channel = %channel, kind = %kind, "Job dead-lettered");
                }
            }
            SendOutcome::TokenResults { results } => {
                self.settle_token_results(channel, job, attempt_index, results)
                    .await?;
            }
        }

        Ok(())
    }

    async fn settle_retryable(
        &self,
        channel: ChannelKind,
        job: &DeliveryJob,
        attempt_index: u32,
        message: &str,
    ) -> Result<()> {
        let metrics = self.metrics.channel(channel);
        let will_retry = job.attempts + 1 < job.max_attempts;

        if will_retry {
            self.attempts
                .settle(
                    &job.id,
                    attempt_index,
                    AttemptStatus::Failed,
                    Some(ErrorKind::Transient),
                    Some(message),
                    None,
                )
                .await?;
            let delay = retry_delay(&self.settings.retry, job.attempts);
            let not_before = now_epoch_ms() + delay.as_millis() as i64;
            self.jobs.schedule_retry(&job.id, not_before, message).await?;
            metrics.failed.inc();
            debug!(
                job_id = %job.id,
                attempt = attempt_index,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retry scheduled"
            );
        } else {
            // Retries consumed: synthetic terminal failure
            self.attempts
                .settle(
                    &job.id,
                    attempt_index,
                    AttemptStatus::Failed,
                    Some(ErrorKind::Exhausted),
                    Some(message),
                    None,
                )
                .await?;
            self.jobs.count_attempt(&job.id).await?;
            self.jobs.mark_dead_lettered(&job.id, message).await?;
            metrics.failed.inc();
            metrics.dead_lettered.inc();
            warn!(job_id = %job.id, channel = %channel, "Retries exhausted, job dead-lettered");
        }
        Ok(())
    }

    async fn settle_token_results(
        &self,
        channel: ChannelKind,
        job: &DeliveryJob,
        attempt_index: u32,
        results: Vec<TokenOutcome>,
    ) -> Result<()> {
        let metrics = self.metrics.channel(channel);
        let any_accepted = results
            .iter()
            .any(|r| matches!(r.status, TokenSendStatus::Accepted { .. }));
        let any_retryable = results
            .iter()
            .any(|r| matches!(r.status, TokenSendStatus::Retryable { .. }));

        if !any_accepted && any_retryable {
            // No delivery and at least one token worth retrying: retry the
            // whole job; the dedup key keeps re-sends idempotent
            return self
                .settle_retryable(channel, job, attempt_index, "provider transient for token batch")
                .await;
        }

        // Terminal: one log row per token, indices increasing from the base
        for (i, result) in results.iter().enumerate() {
            let row_index = attempt_index + i as u32;
            let (status, kind, message, pmid) = match &result.status {
                TokenSendStatus::Accepted {
                    provider_message_id,
                } => (
                    AttemptStatus::Delivered,
                    None,
                    None,
                    Some(provider_message_id.as_str()),
                ),
                TokenSendStatus::Invalid { message } => (
                    AttemptStatus::Failed,
                    Some(ErrorKind::InvalidHandle),
                    Some(message.as_str()),
                    None,
                ),
                TokenSendStatus::Retryable { message } => (
                    AttemptStatus::Failed,
                    Some(ErrorKind::Transient),
                    Some(message.as_str()),
                    None,
                ),
            };

            if i == 0 {
                self.attempts
                    .settle(&job.id, row_index, status, kind, message, pmid)
                    .await?;
            } else {
                self.attempts
                    .append(CreateDeliveryAttempt {
                        notification_id: job.notification_id.clone(),
                        job_id: job.id.clone(),
                        channel,
                        attempt_index: row_index,
                        status,
                        provider_message_id: pmid.map(String::from),
                        error_kind: kind,
                        error_message: message.map(String::from),
                    })
                    .await?;
            }

            match status {
                AttemptStatus::Delivered => {
                    metrics.delivered.inc();
                }
                AttemptStatus::Failed => {
                    metrics.failed.inc();
                }
                _ => {}
            }
        }

        self.jobs.count_attempt(&job.id).await?;
        if any_accepted {
            // At least one device reached: the job succeeded
            self.jobs.mark_succeeded(&job.id).await?;
            metrics.sent.inc();
        } else {
            self.jobs
                .mark_dead_lettered(&job.id, "all device tokens rejected")
                .await?;
            metrics.dead_lettered.inc();
        }
        Ok(())
    }

    /// Append tolerant of re-dispatch: a reclaimed job may already have a
    /// row at this index from the crashed worker
    async fn append_attempt(
        &self,
        job: &DeliveryJob,
        attempt_index: u32,
        status: AttemptStatus,
        error_kind: Option<ErrorKind>,
        error_message: Option<&str>,
        provider_message_id: Option<&str>,
    ) -> Result<()> {
        let request = CreateDeliveryAttempt {
            notification_id: job.notification_id.clone(),
            job_id: job.id.clone(),
            channel: job.channel,
            attempt_index,
            status,
            provider_message_id: provider_message_id.map(String::from),
            error_kind,
            error_message: error_message.map(String::from),
        };

        match self.attempts.append(request).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let existing = self
                    .attempts
                    .find_by_job_and_index(&job.id, attempt_index)
                    .await?;
                if existing.is_some() {
                    debug!(job_id = %job.id, attempt_index, "Attempt row already present");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Internal errors: return the job to pending once; a second
    /// consecutive internal failure dead-letters it.
    async fn internal_failure(&self, job: &DeliveryJob, err: &Error) {
        error!(job_id = %job.id, error = %err, "Internal failure while processing job");

        match self.jobs.record_internal_failure(&job.id).await {
            Ok(count) if count >= 2 => {
                let message = format!("repeated internal failure: {}", err);
                let _ = self
                    .attempts
                    .settle(
                        &job.id,
                        job.attempts + 1,
                        AttemptStatus::Failed,
                        Some(ErrorKind::Internal),
                        Some(&message),
                        None,
                    )
                    .await;
                if let Err(e) = self.jobs.mark_dead_lettered(&job.id, &message).await {
                    error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
                }
                self.metrics.channel(job.channel).dead_lettered.inc();
            }
            Ok(_) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record internal failure"),
        }
    }

    /// Return expired leases to pending so crashed workers cannot strand
    /// jobs in flight
    async fn run_reclaimer(self: Arc<Self>) {
        let period = self.settings.adapter.visibility_timeout() / 2;
        let period = period.max(Duration::from_millis(250));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }

            match self.jobs.reclaim_expired_leases(now_epoch_ms()).await {
                Ok(reclaimed) if reclaimed > 0 => {
                    warn!(reclaimed, "Reclaimed jobs with expired leases");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Lease reclaim failed"),
            }
        }
    }

    /// Periodic maintenance: inbox expiry sweep, retention purge, and
    /// dormant device-token purge
    async fn run_sweeper(self: Arc<Self>) {
        const DORMANT_TOKEN_MS: i64 = 30 * 24 * 3600 * 1000;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.sweep_interval) => {}
            }

            let now = now_epoch_ms();
            if let Err(e) = self.inbox.sweep_expired(now).await {
                error!(error = %e, "Inbox expiry sweep failed");
            }
            if let Err(e) = self.tokens.purge_dormant(now - DORMANT_TOKEN_MS).await {
                error!(error = %e, "Device token purge failed");
            }

            let retention = Duration::from_secs(self.settings.inbox_retention_days as u64 * 86_400);
            let cutoff = co_core::to_rfc3339(
                std::time::SystemTime::now()
                    .checked_sub(retention)
                    .unwrap_or(std::time::UNIX_EPOCH),
            );
            if let Err(e) = self.inbox.purge_older_than(&cutoff).await {
                error!(error = %e, "Inbox retention purge failed");
            }
        }
    }

    /// Sample pending-queue depth into the gauges
    async fn run_depth_sampler(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }

            match self.jobs.pending_counts().await {
                Ok(counts) => {
                    for channel in ChannelKind::ALL {
                        let depth = counts.get(&channel).copied().unwrap_or(0);
                        self.metrics.channel(channel).queue_depth.set(depth);
                    }
                }
                Err(e) => error!(error = %e, "Queue depth sample failed"),
            }
        }
    }
}
