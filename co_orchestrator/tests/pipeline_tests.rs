//! ABOUTME: End-to-end pipeline tests: intake through engine to adapters
//! ABOUTME: Drives the multi-channel, suppression, and reconnect scenarios

use co_channels::{AdapterSet, InAppAdapter};
use co_config::Config;
use co_core::{ChannelKind, ErrorKind, Priority};
use co_db::{
    AttemptStatus, Db, DeliveryAttemptRepository, DeliveryJobRepository, InboxItemRepository,
    JobState, UserPreferenceRepository,
};
use co_engine::{DeliveryEngine, EngineSettings};
use co_orchestrator::{AggregateState, NotificationRequest, Orchestrator};
use co_prefs::PreferenceResolver;
use co_realtime::{ServerEvent, SessionRegistry};
use co_template::Renderer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_support::{seed_fixture_templates, seed_fixture_user, test_db, RecordingAdapter};
use tokio::sync::mpsc;

struct Pipeline {
    db: Db,
    orchestrator: Orchestrator,
    engine: Arc<DeliveryEngine>,
    registry: Arc<SessionRegistry>,
    inbox: InboxItemRepository,
    email: Arc<RecordingAdapter>,
}

async fn pipeline() -> Pipeline {
    let db = test_db().await;

    // u1: email address, in-app enabled, opted in on both; no rows for
    // sms/push so those channels resolve to deny
    seed_fixture_user(&db, &[ChannelKind::Email, ChannelKind::InApp]).await;
    seed_fixture_templates(&db).await;

    let resolver = Arc::new(PreferenceResolver::new(db.clone()));
    let renderer = Arc::new(Renderer::new(db.clone()));
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(300)));
    let inbox = InboxItemRepository::new(db.clone());

    let email = RecordingAdapter::new(ChannelKind::Email);
    let mut adapters = AdapterSet::new();
    adapters.register(email.clone());
    adapters.register(Arc::new(InAppAdapter::new(registry.clone(), inbox.clone())));

    let config = Config::default();
    let mut settings = EngineSettings {
        poll_interval: Duration::from_millis(25),
        sweep_interval: Duration::from_secs(3600),
        ..EngineSettings::from(&config)
    };
    // Normal-priority batches must flush fast enough for the tests
    settings.queue.flush_ms.email_normal = 100;
    settings.queue.flush_ms.sms_normal = 100;
    settings.queue.flush_ms.push_normal = 100;
    let engine = DeliveryEngine::new(
        db.clone(),
        resolver.clone(),
        renderer.clone(),
        adapters,
        settings,
    );
    engine.start();

    let orchestrator = Orchestrator::new(
        db.clone(),
        resolver,
        renderer,
        engine.handle(),
        config.retry.attempts,
    );

    Pipeline {
        db,
        orchestrator,
        engine,
        registry,
        inbox,
        email,
    }
}

fn job_alert(channels: Vec<ChannelKind>) -> NotificationRequest {
    let mut variables = HashMap::new();
    variables.insert("job".to_string(), "Engineer".to_string());
    NotificationRequest {
        user_id: "u1".to_string(),
        kind: "job_alert".to_string(),
        channels,
        template_id: Some("ja-1".to_string()),
        variables,
        payload: None,
        priority: Priority::Normal,
        scheduled_for: None,
        expires_at: None,
        metadata: None,
        persistent: true,
    }
}

async fn wait_all_terminal(db: &Db, notification_id: &str, timeout: Duration) {
    let jobs = DeliveryJobRepository::new(db.clone());
    let deadline = Instant::now() + timeout;
    loop {
        let all = jobs.list_for_notification(notification_id).await.unwrap();
        if !all.is_empty() && all.iter().all(|j| j.state.is_terminal()) {
            return;
        }
        if Instant::now() > deadline {
            let states: Vec<_> = all.iter().map(|j| (j.channel, j.state)).collect();
            panic!("jobs not terminal after {:?}: {:?}", timeout, states);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_happy_path_multi_channel() {
    let p = pipeline().await;

    // u1 has one active session
    let (tx, mut rx) = mpsc::unbounded_channel();
    p.registry.register("s1", "u1", "127.0.0.1", tx).await;

    let id = p
        .orchestrator
        .submit(job_alert(vec![ChannelKind::Email, ChannelKind::InApp]))
        .await
        .unwrap();

    wait_all_terminal(&p.db, &id, Duration::from_secs(10)).await;

    // Both jobs succeeded
    let status = p.orchestrator.status(&id).await.unwrap();
    assert_eq!(status.state, AggregateState::Delivered);
    assert_eq!(status.jobs.len(), 2);
    assert!(status.jobs.iter().all(|j| j.state == JobState::Succeeded));

    // The email went out once and its attempt is `sent` until the
    // provider callback lands
    assert_eq!(p.email.item_count(), 1);
    let attempts = DeliveryAttemptRepository::new(p.db.clone());
    let email_attempt = status
        .attempts
        .iter()
        .find(|a| a.channel == ChannelKind::Email)
        .unwrap();
    assert_eq!(email_attempt.status, AttemptStatus::Sent);

    // Provider callback closes the loop
    let pmid = email_attempt.provider_message_id.clone().unwrap();
    assert!(attempts
        .update_status_by_provider_id(&pmid, AttemptStatus::Delivered)
        .await
        .unwrap());
    let status = p.orchestrator.status(&id).await.unwrap();
    let email_attempt = status
        .attempts
        .iter()
        .find(|a| a.channel == ChannelKind::Email)
        .unwrap();
    assert_eq!(email_attempt.status, AttemptStatus::Delivered);

    // Exactly one realtime notification event reached the session
    let mut notification_events = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ServerEvent::Notification { .. }) {
            notification_events += 1;
        }
    }
    assert_eq!(notification_events, 1);

    // The inbox holds one unread item
    let page = p.inbox.list("u1", 1, 10, true).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.unread_count, 1);

    p.engine.shutdown().await;
}

#[tokio::test]
async fn test_preference_suppression_skips_channel() {
    let p = pipeline().await;

    // Disable email for u1
    UserPreferenceRepository::new(p.db.clone())
        .upsert("u1", ChannelKind::Email, false, true, Some("a@x.test"), &HashMap::new())
        .await
        .unwrap();

    let id = p
        .orchestrator
        .submit(job_alert(vec![ChannelKind::Email, ChannelKind::InApp]))
        .await
        .unwrap();

    wait_all_terminal(&p.db, &id, Duration::from_secs(10)).await;

    // One job only (in-app); email terminated as a suppressed log entry
    let jobs = DeliveryJobRepository::new(p.db.clone())
        .list_for_notification(&id)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].channel, ChannelKind::InApp);
    assert_eq!(jobs[0].state, JobState::Succeeded);

    let attempts = DeliveryAttemptRepository::new(p.db.clone())
        .list_for_notification(&id)
        .await
        .unwrap();
    let suppressed: Vec<_> = attempts
        .iter()
        .filter(|a| a.channel == ChannelKind::Email)
        .collect();
    assert_eq!(suppressed.len(), 1);
    assert_eq!(suppressed[0].status, AttemptStatus::Expired);
    assert_eq!(suppressed[0].error_kind, Some(ErrorKind::Suppressed));

    // Zero send calls to the email adapter
    assert_eq!(p.email.item_count(), 0);

    // In-app proceeded normally
    assert_eq!(p.inbox.unread_count("u1").await.unwrap(), 1);

    p.engine.shutdown().await;
}

#[tokio::test]
async fn test_offline_then_reconnect_backlog() {
    let p = pipeline().await;

    // No active session at submit time: store-and-forward only
    let id = p
        .orchestrator
        .submit(job_alert(vec![ChannelKind::InApp]))
        .await
        .unwrap();
    wait_all_terminal(&p.db, &id, Duration::from_secs(10)).await;

    // A session connects afterwards; it gets the item via the backlog
    // query, and no realtime event was ever addressed to it
    let (tx, mut rx) = mpsc::unbounded_channel();
    p.registry.register("s-late", "u1", "127.0.0.1", tx).await;

    let backlog = p.inbox.unread("u1", 50).await.unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].notification_id, id);

    assert!(rx.try_recv().is_err(), "no duplicate realtime event");

    // Exactly one inbox item
    let page = p.inbox.list("u1", 1, 10, false).await.unwrap();
    assert_eq!(page.total, 1);

    p.engine.shutdown().await;
}

#[tokio::test]
async fn test_jobs_equal_channels_minus_suppressed() {
    let p = pipeline().await;

    // SMS and push have no preference rows; email and in-app are allowed
    let id = p
        .orchestrator
        .submit(job_alert(vec![
            ChannelKind::Email,
            ChannelKind::Sms,
            ChannelKind::Push,
            ChannelKind::InApp,
        ]))
        .await
        .unwrap();

    let jobs = DeliveryJobRepository::new(p.db.clone())
        .list_for_notification(&id)
        .await
        .unwrap();
    let attempts = DeliveryAttemptRepository::new(p.db.clone())
        .list_for_notification(&id)
        .await
        .unwrap();

    let suppressed = attempts
        .iter()
        .filter(|a| a.error_kind == Some(ErrorKind::Suppressed))
        .count();

    // |jobs| == |channels| - |suppressed|
    assert_eq!(jobs.len(), 4 - suppressed);
    assert_eq!(suppressed, 2);

    p.engine.shutdown().await;
}
