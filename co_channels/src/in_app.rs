//! ABOUTME: In-app adapter: realtime fan-out plus store-and-forward inbox
//! ABOUTME: Persists when no session is live or the job requests persistence

use crate::{Capabilities, ChannelAdapter, DeliveryItem, SendOutcome};
use async_trait::async_trait;
use co_core::{ChannelKind, ErrorKind};
use co_db::{CreateInboxItem, InboxItemRepository};
use co_realtime::{InboxItemView, ServerEvent, SessionRegistry};
use co_template::RenderedPayload;
use std::sync::Arc;
use tracing::{debug, warn};

/// In-app adapter
pub struct InAppAdapter {
    registry: Arc<SessionRegistry>,
    inbox: InboxItemRepository,
}

impl InAppAdapter {
    pub fn new(registry: Arc<SessionRegistry>, inbox: InboxItemRepository) -> Self {
        Self { registry, inbox }
    }

    async fn send_one(&self, item: &DeliveryItem) -> SendOutcome {
        let RenderedPayload::InApp {
            title,
            body,
            action_url,
            icon,
        } = &item.payload
        else {
            return SendOutcome::permanent(ErrorKind::Permanent, "Payload is not an in-app payload");
        };

        let has_session = self.registry.has_active_session(&item.user_id).await;

        // Store-and-forward is required when no session is live, and kept
        // on by default so reconnecting clients recover state
        let stored = if item.persistent || !has_session {
            match self
                .inbox
                .create(CreateInboxItem {
                    user_id: item.user_id.clone(),
                    notification_id: item.notification_id.clone(),
                    kind: item.kind.clone(),
                    title: title.clone(),
                    body: body.clone(),
                    action_url: action_url.clone(),
                    icon: icon.clone(),
                    expires_at: item.expires_at,
                })
                .await
            {
                Ok(stored) => Some(stored),
                Err(e) => {
                    warn!(job_id = %item.job_id, error = %e, "Failed to store inbox item");
                    return SendOutcome::retryable(format!("Inbox write failed: {}", e));
                }
            }
        } else {
            None
        };

        // Realtime fan-out to every active session; sessions connecting
        // later recover via the reconnect backlog instead
        let mut delivered_sessions = 0;
        if has_session {
            let view = match &stored {
                Some(item) => InboxItemView::from(item.clone()),
                None => InboxItemView {
                    id: item.job_id.clone(),
                    kind: item.kind.clone(),
                    title: title.clone(),
                    body: body.clone(),
                    action_url: action_url.clone(),
                    icon: icon.clone(),
                    created_at: co_core::time::now_iso8601(),
                    read: false,
                },
            };
            delivered_sessions = self
                .registry
                .send_to_user(&item.user_id, &ServerEvent::Notification { item: view })
                .await;

            if let Ok(count) = self.inbox.unread_count(&item.user_id).await {
                self.registry
                    .send_to_user(&item.user_id, &ServerEvent::UnreadCount { count })
                    .await;
            }
        }

        debug!(
            job_id = %item.job_id,
            user_id = %item.user_id,
            delivered_sessions,
            stored = stored.is_some(),
            "In-app delivery"
        );

        SendOutcome::Accepted {
            provider_message_id: stored.map(|s| s.id),
        }
    }
}

#[async_trait]
impl ChannelAdapter for InAppAdapter {
    fn channel(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_broadcast: true,
            supports_attachments: false,
            max_body_bytes: Some(64 * 1024),
        }
    }

    async fn send(&self, batch: &[DeliveryItem]) -> Vec<SendOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for item in batch {
            outcomes.push(self.send_one(item).await);
        }
        outcomes
    }
}
