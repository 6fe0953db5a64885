//! ABOUTME: Shared testing utilities and fixtures for all crates
//! ABOUTME: In-memory database setup, seeded users/templates, recording adapter

use async_trait::async_trait;
use co_channels::{Capabilities, ChannelAdapter, DeliveryItem, SendOutcome};
use co_core::ChannelKind;
use co_db::{Db, TemplateRepository, UserPreferenceRepository};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Simple test helper function to demonstrate cross-crate testing
pub fn create_test_id() -> String {
    "test-id-123".to_string()
}

/// User id used by fixture data across crate test suites
pub fn fixture_user_id() -> String {
    "u1".to_string()
}

/// Template id used by fixture data across crate test suites
pub fn fixture_template_id() -> String {
    "ja-1".to_string()
}

/// Contact handle seeded on the fixture user's preference row
pub fn fixture_handle(channel: ChannelKind) -> Option<&'static str> {
    match channel {
        ChannelKind::Email => Some("a@x.test"),
        ChannelKind::Sms => Some("+15551230000"),
        ChannelKind::Push | ChannelKind::InApp => None,
    }
}

/// In-memory database with migrations applied
pub async fn test_db() -> Db {
    Db::new_in_memory().await.expect("in-memory database")
}

/// Opt the fixture user in on the given channels.
///
/// Channels not listed get no preference row at all, so resolution
/// denies them.
pub async fn seed_fixture_user(db: &Db, channels: &[ChannelKind]) {
    let prefs = UserPreferenceRepository::new(db.clone());
    let user_id = fixture_user_id();
    for &channel in channels {
        prefs
            .upsert(
                &user_id,
                channel,
                true,
                true,
                fixture_handle(channel),
                &HashMap::new(),
            )
            .await
            .expect("seed preference row");
    }
}

/// Seed the email and in-app variants of the fixture template
pub async fn seed_fixture_templates(db: &Db) {
    let templates = TemplateRepository::new(db.clone());
    let id = fixture_template_id();

    templates
        .upsert(
            &id,
            ChannelKind::Email,
            Some("New job: {{job}}"),
            "A {{job}} role is open.",
            Some("<p>A {{job}} role is open.</p>"),
            None,
            None,
            &["job".to_string()],
        )
        .await
        .expect("seed email template");

    templates
        .upsert(
            &id,
            ChannelKind::InApp,
            None,
            "A {{job}} role is open.",
            None,
            Some("New job: {{job}}"),
            None,
            &["job".to_string()],
        )
        .await
        .expect("seed in-app template");
}

/// Channel adapter double that replays scripted outcomes and records calls.
///
/// Outcomes are consumed from the script one per item; once the script
/// runs dry every item is accepted with a provider message id derived
/// from its job id.
pub struct RecordingAdapter {
    channel: ChannelKind,
    script: Mutex<Vec<SendOutcome>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingAdapter {
    pub fn new(channel: ChannelKind) -> Arc<Self> {
        Self::with_script(channel, Vec::new())
    }

    pub fn with_script(channel: ChannelKind, script: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Number of send calls that reached the adapter
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Total items across all send calls
    pub fn item_count(&self) -> usize {
        self.calls.lock().unwrap().iter().map(|call| call.len()).sum()
    }

    /// Job ids per send call, in call order
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn channel(&self) -> ChannelKind {
        self.channel
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_broadcast: false,
            supports_attachments: false,
            max_body_bytes: None,
        }
    }

    async fn send(&self, batch: &[DeliveryItem]) -> Vec<SendOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push(batch.iter().map(|item| item.job_id.clone()).collect());

        let mut script = self.script.lock().unwrap();
        batch
            .iter()
            .map(|item| {
                if script.is_empty() {
                    SendOutcome::Accepted {
                        provider_message_id: Some(format!("pm-{}", item.job_id)),
                    }
                } else {
                    script.remove(0)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use co_prefs::ContactHandle;
    use co_template::RenderedPayload;

    fn item(job_id: &str) -> DeliveryItem {
        DeliveryItem {
            job_id: job_id.to_string(),
            notification_id: "n1".to_string(),
            user_id: fixture_user_id(),
            kind: "job_alert".to_string(),
            attempt_index: 1,
            priority: co_core::Priority::Normal,
            payload: RenderedPayload::Sms {
                body: "b".to_string(),
            },
            handle: ContactHandle::None,
            persistent: true,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_seeded_fixture_rows_exist() {
        let db = test_db().await;
        seed_fixture_user(&db, &[ChannelKind::Email, ChannelKind::InApp]).await;
        seed_fixture_templates(&db).await;

        let prefs = UserPreferenceRepository::new(db.clone());
        let email = prefs
            .find(&fixture_user_id(), ChannelKind::Email)
            .await
            .unwrap()
            .unwrap();
        assert!(email.enabled && email.opt_in);
        assert_eq!(email.handle.as_deref(), fixture_handle(ChannelKind::Email));
        assert!(prefs
            .find(&fixture_user_id(), ChannelKind::Sms)
            .await
            .unwrap()
            .is_none());

        let templates = TemplateRepository::new(db);
        assert!(templates.exists(&fixture_template_id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_recording_adapter_defaults_to_accept() {
        let adapter = RecordingAdapter::new(ChannelKind::Sms);
        let outcomes = adapter.send(&[item("j1"), item("j2")]).await;

        assert_eq!(
            outcomes[0],
            SendOutcome::Accepted {
                provider_message_id: Some("pm-j1".to_string())
            }
        );
        assert_eq!(adapter.call_count(), 1);
        assert_eq!(adapter.item_count(), 2);
        assert_eq!(adapter.calls(), vec![vec!["j1".to_string(), "j2".to_string()]]);
    }

    #[tokio::test]
    async fn test_recording_adapter_replays_script_in_order() {
        let adapter = RecordingAdapter::with_script(
            ChannelKind::Sms,
            vec![SendOutcome::retryable("first"), SendOutcome::retryable("second")],
        );

        let outcomes = adapter.send(&[item("j1")]).await;
        assert_eq!(outcomes[0], SendOutcome::retryable("first"));
        let outcomes = adapter.send(&[item("j1")]).await;
        assert_eq!(outcomes[0], SendOutcome::retryable("second"));

        // Script exhausted: back to accepting
        let outcomes = adapter.send(&[item("j1")]).await;
        assert!(matches!(outcomes[0], SendOutcome::Accepted { .. }));
    }
}
