//! ABOUTME: Transactional email adapter over SMTP
//! ABOUTME: Checks the suppression list before send and maps bounce callbacks

use crate::{Capabilities, ChannelAdapter, DeliveryItem, SendOutcome};
use async_trait::async_trait;
use co_config::SmtpConfig;
use co_core::{ChannelKind, ErrorKind};
use co_db::{AttemptStatus, SuppressionRepository};
use co_prefs::ContactHandle;
use co_template::RenderedPayload;
use lettre::{
    message::{Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, warn};

/// Email adapter sending through an async SMTP transport
pub struct EmailAdapter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
    suppressions: SuppressionRepository,
}

impl EmailAdapter {
    pub fn new(config: &SmtpConfig, suppressions: SuppressionRepository) -> co_core::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| co_core::Error::Config(format!("Invalid SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            from_address: config.from_address.clone(),
            suppressions,
        })
    }

    /// Test constructor around an arbitrary transport target
    pub fn with_transport(
        transport: AsyncSmtpTransport<Tokio1Executor>,
        from_address: String,
        suppressions: SuppressionRepository,
    ) -> Self {
        Self {
            transport,
            from_address,
            suppressions,
        }
    }

    async fn send_one(&self, item: &DeliveryItem) -> SendOutcome {
        let ContactHandle::Address(recipient) = &item.handle else {
            return SendOutcome::permanent(ErrorKind::InvalidHandle, "No email address resolved");
        };

        let RenderedPayload::Email {
            subject,
            html,
            text,
        } = &item.payload
        else {
            return SendOutcome::permanent(ErrorKind::Permanent, "Payload is not an email payload");
        };

        match self
            .suppressions
            .is_suppressed(ChannelKind::Email, recipient)
            .await
        {
            Ok(true) => {
                debug!(job_id = %item.job_id, "Recipient on suppression list");
                return SendOutcome::permanent(ErrorKind::Suppressed, "Recipient suppressed");
            }
            Ok(false) => {}
            Err(e) => return SendOutcome::retryable(format!("Suppression lookup failed: {}", e)),
        }

        let to: Mailbox = match recipient.parse() {
            Ok(mailbox) => mailbox,
            Err(e) => {
                return SendOutcome::permanent(
                    ErrorKind::InvalidHandle,
                    format!("Malformed address: {}", e),
                )
            }
        };
        let from: Mailbox = match self.from_address.parse() {
            Ok(mailbox) => mailbox,
            Err(e) => {
                return SendOutcome::permanent(
                    ErrorKind::Permanent,
                    format!("Malformed sender address: {}", e),
                )
            }
        };

        // The message id doubles as the provider dedup key, so a
        // reclaimed job re-sends with the same id
        let message_id = format!("<{}@courier>", item.dedup_key(ChannelKind::Email));

        let builder = Message::builder()
            .from(from)
            .to(to)
            .subject(subject.as_str())
            .message_id(Some(message_id.clone()));

        let message = match html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                text.clone(),
                html.clone(),
            )),
            None => builder.singlepart(SinglePart::plain(text.clone())),
        };
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                return SendOutcome::permanent(
                    ErrorKind::Permanent,
                    format!("Failed to build message: {}", e),
                )
            }
        };

        match self.transport.send(message).await {
            Ok(_) => SendOutcome::Accepted {
                provider_message_id: Some(message_id),
            },
            Err(e) if e.is_permanent() => {
                warn!(job_id = %item.job_id, error = %e, "SMTP permanent rejection");
                SendOutcome::permanent(ErrorKind::Permanent, e.to_string())
            }
            Err(e) => SendOutcome::retryable(e.to_string()),
        }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_broadcast: false,
            supports_attachments: true,
            max_body_bytes: Some(10 * 1024 * 1024),
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

/// What a provider email callback maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailCallbackAction {
    pub status: AttemptStatus,
    /// Add the recipient to the suppression list
    pub suppress: bool,
}

/// Map a provider email event name to the internal status
pub fn translate_email_event(event: &str) -> Option<EmailCallbackAction> {
    let (status, suppress) = match event {
        "delivered" => (AttemptStatus::Delivered, false),
        "hard_bounce" => (AttemptStatus::Bounced, true),
        "complaint" => (AttemptStatus::Bounced, true),
        "soft_bounce" => (AttemptStatus::Failed, false),
        "opened" => (AttemptStatus::Opened, false),
        "clicked" => (AttemptStatus::Clicked, false),
        _ => return None,
    };
    Some(EmailCallbackAction { status, suppress })
}

#[cfg(test)]
mod tests {
    use super::*;
    use co_core::Priority;
    use co_db::Db;

    async fn adapter(db: &Db) -> EmailAdapter {
        // Transport pointed at a closed local port: connection errors are
        // classified as retryable
        let transport =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("127.0.0.1")
                .port(1)
                .build();
        EmailAdapter::with_transport(
            transport,
            "noreply@courier.test".to_string(),
            SuppressionRepository::new(db.clone()),
        )
    }

    fn item(handle: ContactHandle) -> DeliveryItem {
        DeliveryItem {
            job_id: "j1".to_string(),
            notification_id: "n1".to_string(),
            user_id: "u1".to_string(),
            kind: "job_alert".to_string(),
            attempt_index: 1,
            priority: Priority::Normal,
            payload: RenderedPayload::Email {
                subject: "s".to_string(),
                html: None,
                text: "t".to_string(),
            },
            handle,
            persistent: true,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_suppressed_recipient_rejected_without_send() {
        let db = Db::new_in_memory().await.unwrap();
        SuppressionRepository::new(db.clone())
            .add(ChannelKind::Email, "a@x.test", "hard_bounce")
            .await
            .unwrap();
        let adapter = adapter(&db).await;

        let outcomes = adapter
            .send(&[item(ContactHandle::Address("a@x.test".to_string()))])
            .await;
        assert_eq!(
            outcomes[0],
            SendOutcome::Permanent {
                kind: ErrorKind::Suppressed,
                message: "Recipient suppressed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_address_is_permanent() {
        let db = Db::new_in_memory().await.unwrap();
        let adapter = adapter(&db).await;

        let outcomes = adapter
            .send(&[item(ContactHandle::Address("not-an-address".to_string()))])
            .await;
        assert!(matches!(
            outcomes[0],
            SendOutcome::Permanent {
                kind: ErrorKind::InvalidHandle,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connection_failure_is_retryable() {
        let db = Db::new_in_memory().await.unwrap();
        let adapter = adapter(&db).await;

        let outcomes = adapter
            .send(&[item(ContactHandle::Address("b@x.test".to_string()))])
            .await;
        assert!(matches!(outcomes[0], SendOutcome::Retryable { .. }));
    }

    #[test]
    fn test_callback_translation() {
        assert_eq!(
            translate_email_event("delivered"),
            Some(EmailCallbackAction {
                status: AttemptStatus::Delivered,
                suppress: false
            })
        );
        assert_eq!(
            translate_email_event("hard_bounce"),
            Some(EmailCallbackAction {
                status: AttemptStatus::Bounced,
                suppress: true
            })
        );
        assert_eq!(
            translate_email_event("complaint"),
            Some(EmailCallbackAction {
                status: AttemptStatus::Bounced,
                suppress: true
            })
        );
        assert_eq!(
            translate_email_event("soft_bounce").map(|a| a.suppress),
            Some(false)
        );
        assert_eq!(
            translate_email_event("opened").map(|a| a.status),
            Some(AttemptStatus::Opened)
        );
        assert!(translate_email_event("unknown_event").is_none());
    }

    #[test]
    fn test_capabilities() {
        // Static contract values, independent of transport state
        let caps = Capabilities {
            supports_broadcast: false,
            supports_attachments: true,
            max_body_bytes: Some(10 * 1024 * 1024),
        };
        assert!(!caps.supports_broadcast);
        assert!(caps.supports_attachments);
    }
}
