//! ABOUTME: Mobile/web push adapter over an HTTP push provider
//! ABOUTME: Expands users to active device tokens and classifies per-token results

use crate::{Capabilities, ChannelAdapter, DeliveryItem, SendOutcome};
use async_trait::async_trait;
use co_config::PushProviderConfig;
use co_core::{time::now_epoch_ms, ChannelKind, ErrorKind};
use co_db::DeviceTokenRepository;
use co_prefs::ContactHandle;
use co_template::RenderedPayload;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Outcome for one device token within a push item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenOutcome {
    pub token: String,
    pub status: TokenSendStatus,
}

/// Per-token classification of the provider response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenSendStatus {
    Accepted { provider_message_id: String },
    /// Token rejected as unregistered/invalid; marked inactive
    Invalid { message: String },
    Retryable { message: String },
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    tokens: &'a [String],
    notification: PushNotification<'a>,
    data: &'a std::collections::HashMap<String, String>,
    idempotency_key: String,
}

#[derive(Debug, Serialize)]
struct PushNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    results: Vec<PushTokenResult>,
}

#[derive(Debug, Deserialize)]
struct PushTokenResult {
    status: String,
    message_id: Option<String>,
    error: Option<String>,
}

/// Push adapter posting token batches to the provider
pub struct PushAdapter {
    client: Client,
    config: PushProviderConfig,
    tokens: DeviceTokenRepository,
}

impl PushAdapter {
    pub fn new(config: PushProviderConfig, tokens: DeviceTokenRepository) -> Self {
        Self {
            client: Client::new(),
            config,
            tokens,
        }
    }

    async fn send_one(&self, item: &DeliveryItem) -> SendOutcome {
        let RenderedPayload::Push { title, body, data } = &item.payload else {
            return SendOutcome::permanent(ErrorKind::Permanent, "Payload is not a push payload");
        };

        // Resolve the token set: explicit tokens from the handle, or the
        // user's registry entries when the handle carries none
        let tokens: Vec<String> = match &item.handle {
            ContactHandle::Tokens(tokens) if !tokens.is_empty() => tokens.clone(),
            _ => match self.tokens.active_for_user(&item.user_id).await {
                Ok(rows) => rows.into_iter().map(|t| t.token).collect(),
                Err(e) => return SendOutcome::retryable(format!("Token lookup failed: {}", e)),
            },
        };

        if tokens.is_empty() {
            return SendOutcome::permanent(ErrorKind::NoTokens, "No active device tokens");
        }

        debug!(job_id = %item.job_id, token_count = tokens.len(), "Sending push");

        let request = PushRequest {
            tokens: &tokens,
            notification: PushNotification {
                title: title.as_str(),
                body: body.as_str(),
            },
            data,
            idempotency_key: item.dedup_key(ChannelKind::Push),
        };

        let response = self
            .client
            .post(format!("{}/send", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return SendOutcome::retryable(format!("Request failed: {}", e)),
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return SendOutcome::retryable(format!("Provider {}", status));
        }
        if !status.is_success() {
            return SendOutcome::permanent(ErrorKind::Permanent, format!("Provider {}", status));
        }

        let parsed: PushResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => return SendOutcome::retryable(format!("Malformed provider response: {}", e)),
        };

        if parsed.results.len() != tokens.len() {
            return SendOutcome::retryable(format!(
                "Provider returned {} results for {} tokens",
                parsed.results.len(),
                tokens.len()
            ));
        }

        let mut results = Vec::with_capacity(tokens.len());
        let mut accepted_tokens = Vec::new();
        for (token, result) in tokens.iter().zip(parsed.results) {
            let outcome = match result.status.as_str() {
                "ok" => {
                    accepted_tokens.push(token.clone());
                    TokenSendStatus::Accepted {
                        provider_message_id: result
                            .message_id
                            .unwrap_or_else(|| item.dedup_key(ChannelKind::Push)),
                    }
                }
                "unregistered" | "invalid_token" => {
                    // Registry side effect: the token never works again
                    if let Err(e) = self.tokens.deactivate(token).await {
                        warn!(error = %e, "Failed to deactivate rejected token");
                    }
                    TokenSendStatus::Invalid {
                        message: result.error.unwrap_or_else(|| result.status.clone()),
                    }
                }
                _ => TokenSendStatus::Retryable {
                    message: result.error.unwrap_or_else(|| result.status.clone()),
                },
            };
            results.push(TokenOutcome {
                token: token.clone(),
                status: outcome,
            });
        }

        if !accepted_tokens.is_empty() {
            if let Err(e) = self.tokens.touch(&accepted_tokens, now_epoch_ms()).await {
                warn!(error = %e, "Failed to refresh token last_used");
            }
        }

        SendOutcome::TokenResults { results }
    }

    /// Broadcast to a named topic instead of a token set.
    ///
    /// Topic fan-out happens provider-side; one accepted request covers
    /// every subscriber.
    pub async fn send_topic(
        &self,
        topic: &str,
        title: &str,
        body: &str,
        data: &std::collections::HashMap<String, String>,
    ) -> SendOutcome {
        if topic.trim().is_empty() {
            return SendOutcome::permanent(ErrorKind::InvalidHandle, "Empty topic name");
        }

        let response = self
            .client
            .post(format!(
                "{}/topics/{}/send",
                self.config.base_url.trim_end_matches('/'),
                topic
            ))
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "notification": { "title": title, "body": body },
                "data": data,
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return SendOutcome::retryable(format!("Request failed: {}", e)),
        };

        let status = response.status();
        if status.is_success() {
            let id = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("message_id").and_then(|m| m.as_str()).map(String::from));
            SendOutcome::Accepted {
                provider_message_id: id,
            }
        } else if status.as_u16() == 429 || status.is_server_error() {
            SendOutcome::retryable(format!("Provider {}", status))
        } else {
            SendOutcome::permanent(ErrorKind::Permanent, format!("Provider {}", status))
        }
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_broadcast: true,
            supports_attachments: false,
            max_body_bytes: Some(4096),
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
