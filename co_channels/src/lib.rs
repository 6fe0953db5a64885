//! ABOUTME: Channel adapter contract and the four delivery adapters
//! ABOUTME: Adapters classify outcomes; the engine alone decides retries

use async_trait::async_trait;
use co_core::{ChannelKind, ErrorKind, Priority};
use co_prefs::ContactHandle;
use co_template::RenderedPayload;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub mod email;
pub mod in_app;
pub mod push;
pub mod sms;

pub use email::{translate_email_event, EmailAdapter, EmailCallbackAction};
pub use in_app::InAppAdapter;
pub use push::{PushAdapter, TokenOutcome, TokenSendStatus};
pub use sms::{normalize_msisdn, translate_sms_status, SmsAdapter};

/// One unit of work handed to an adapter.
///
/// The handle is resolved at dispatch time so long-queued jobs see
/// current preferences.
#[derive(Debug, Clone)]
pub struct DeliveryItem {
    pub job_id: String,
    pub notification_id: String,
    pub user_id: String,
    /// Notification kind, e.g. `job_alert`
    pub kind: String,
    /// 1-based index of this try, for idempotent provider dedup keys
    pub attempt_index: u32,
    pub priority: Priority,
    pub payload: RenderedPayload,
    pub handle: ContactHandle,
    /// In-app: force store-and-forward even with live sessions
    pub persistent: bool,
    /// Epoch millis; in-app items inherit this expiry
    pub expires_at: Option<i64>,
}

impl DeliveryItem {
    /// Deterministic dedup key sent to providers so a reclaimed job
    /// cannot double-deliver
    pub fn dedup_key(&self, channel: ChannelKind) -> String {
        format!(
            "{}:{}:{}",
            self.notification_id,
            channel.as_str(),
            self.attempt_index
        )
    }
}

/// Outcome of sending one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Provider accepted the item
    Accepted {
        provider_message_id: Option<String>,
    },
    /// Transient condition; the engine may retry with backoff
    Retryable { message: String },
    /// Unambiguous rejection; the engine dead-letters (or expires, for
    /// suppressions)
    Permanent { kind: ErrorKind, message: String },
    /// Push only: per-token outcomes for a token-expanded item
    TokenResults { results: Vec<TokenOutcome> },
}

impl SendOutcome {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn permanent(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind,
            message: message.into(),
        }
    }
}

/// Static capabilities of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_broadcast: bool,
    pub supports_attachments: bool,
    pub max_body_bytes: Option<usize>,
}

/// Uniform adapter contract.
///
/// `send` returns one outcome per input item, in input order, and never
/// fails as a whole: every per-item problem is classified into its
/// outcome. Adapters are idempotent against re-sends of the same
/// `(notification_id, channel, attempt_index)` via the dedup key.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> ChannelKind;

    fn capabilities(&self) -> Capabilities;

    async fn send(&self, batch: &[DeliveryItem]) -> Vec<SendOutcome>;
}

/// The four adapters wired for the engine
#[derive(Clone)]
pub struct AdapterSet {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    pub fn get(&self, channel: ChannelKind) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<ChannelKind> {
        self.adapters.keys().copied().collect()
    }
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAdapter(ChannelKind);

    #[async_trait]
    impl ChannelAdapter for NullAdapter {
        fn channel(&self) -> ChannelKind {
            self.0
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_broadcast: false,
                supports_attachments: false,
                max_body_bytes: None,
            }
        }

        async fn send(&self, batch: &[DeliveryItem]) -> Vec<SendOutcome> {
            batch
                .iter()
                .map(|_| SendOutcome::Accepted {
                    provider_message_id: None,
                })
                .collect()
        }
    }

    #[test]
    fn test_adapter_set_lookup() {
        let mut set = AdapterSet::new();
        set.register(Arc::new(NullAdapter(ChannelKind::Email)));
        set.register(Arc::new(NullAdapter(ChannelKind::Sms)));

        assert!(set.get(ChannelKind::Email).is_some());
        assert!(set.get(ChannelKind::Push).is_none());
        assert_eq!(set.channels().len(), 2);
    }

    #[test]
    fn test_dedup_key_is_stable() {
        let item = DeliveryItem {
            job_id: "j1".to_string(),
            notification_id: "n1".to_string(),
            user_id: "u1".to_string(),
            kind: "job_alert".to_string(),
            attempt_index: 2,
            priority: Priority::Normal,
            payload: RenderedPayload::Sms {
                body: "hi".to_string(),
            },
            handle: ContactHandle::Address("+15551230000".to_string()),
            persistent: true,
            expires_at: None,
        };
        assert_eq!(item.dedup_key(ChannelKind::Sms), "n1:sms:2");
        assert_eq!(item.dedup_key(ChannelKind::Sms), item.dedup_key(ChannelKind::Sms));
    }
}
