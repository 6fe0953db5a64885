//! ABOUTME: SMS adapter over an HTTP messaging provider
//! ABOUTME: E.164 normalization, length caps, and per-country sender rules

use crate::{Capabilities, ChannelAdapter, DeliveryItem, SendOutcome};
use async_trait::async_trait;
use co_config::SmsProviderConfig;
use co_core::{ChannelKind, ErrorKind};
use co_db::AttemptStatus;
use co_prefs::ContactHandle;
use co_template::RenderedPayload;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

/// Maximum rendered body length (concatenated segments)
pub const MAX_SMS_LENGTH: usize = 1600;

/// Country calling codes that reject alphanumeric sender ids
const NO_ALPHA_SENDER: &[&str] = &["1", "86"];

/// Country calling codes with quiet hours (UTC, inclusive start, exclusive end)
const QUIET_HOURS: &[(&str, u32, u32)] = &[("91", 21, 9)];

/// Normalize a raw phone number to E.164.
///
/// Separator characters are stripped; a bare national number is
/// reformatted by prepending the default country code when its length
/// matches a national format. Ambiguous input is an error.
pub fn normalize_msisdn(raw: &str, default_country_code: &str) -> Result<String, String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    let digits_only = |s: &str| s.chars().all(|c| c.is_ascii_digit());

    let candidate = if let Some(rest) = cleaned.strip_prefix('+') {
        if !digits_only(rest) {
            return Err(format!("Non-digit characters in number: {}", raw));
        }
        cleaned
    } else if let Some(rest) = cleaned.strip_prefix("00") {
        if !digits_only(rest) {
            return Err(format!("Non-digit characters in number: {}", raw));
        }
        format!("+{}", rest)
    } else if digits_only(&cleaned) && (8..=12).contains(&cleaned.len()) {
        // National format; unambiguous once the default country code fits
        format!("+{}{}", default_country_code, cleaned)
    } else {
        return Err(format!("Not reformattable to E.164: {}", raw));
    };

    // E.164: 8..=15 digits after the plus
    let digits = candidate.len() - 1;
    if !(8..=15).contains(&digits) {
        return Err(format!("E.164 length out of range: {}", raw));
    }
    Ok(candidate)
}

/// Country calling code of an E.164 number, longest-match first
fn country_code(msisdn: &str) -> Option<&str> {
    let digits = msisdn.strip_prefix('+')?;
    for len in (1..=3).rev() {
        if digits.len() > len {
            let prefix = &digits[..len];
            if NO_ALPHA_SENDER.contains(&prefix)
                || QUIET_HOURS.iter().any(|(cc, _, _)| *cc == prefix)
            {
                return Some(prefix);
            }
        }
    }
    digits.get(..1)
}

/// Check the destination country's sender rules.
///
/// Returns the violation description when the send must be rejected.
pub fn sender_violation(to: &str, from_sender: &str, hour_utc: u32) -> Option<String> {
    let cc = country_code(to)?;

    let alphanumeric_sender = !from_sender.starts_with('+')
        && from_sender.chars().any(|c| c.is_ascii_alphabetic());
    if alphanumeric_sender && NO_ALPHA_SENDER.contains(&cc) {
        return Some(format!(
            "Alphanumeric sender not permitted for +{} destinations",
            cc
        ));
    }

    for (quiet_cc, start, end) in QUIET_HOURS {
        if *quiet_cc == cc {
            let in_quiet = if start <= end {
                hour_utc >= *start && hour_utc < *end
            } else {
                hour_utc >= *start || hour_utc < *end
            };
            if in_quiet {
                return Some(format!(
                    "Destination +{} rejects messages during quiet hours",
                    cc
                ));
            }
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(alias = "sid")]
    id: Option<String>,
}

/// SMS adapter posting to the provider's message endpoint
pub struct SmsAdapter {
    client: Client,
    config: SmsProviderConfig,
}

impl SmsAdapter {
    pub fn new(config: SmsProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn send_one(&self, item: &DeliveryItem) -> SendOutcome {
        let ContactHandle::Address(raw_number) = &item.handle else {
            return SendOutcome::permanent(ErrorKind::InvalidHandle, "No phone number resolved");
        };

        let RenderedPayload::Sms { body } = &item.payload else {
            return SendOutcome::permanent(ErrorKind::Permanent, "Payload is not an SMS payload");
        };

        if body.chars().count() > MAX_SMS_LENGTH {
            return SendOutcome::permanent(
                ErrorKind::TooLong,
                format!("Rendered body exceeds {} characters", MAX_SMS_LENGTH),
            );
        }

        let to = match normalize_msisdn(raw_number, &self.config.default_country_code) {
            Ok(to) => to,
            Err(e) => return SendOutcome::permanent(ErrorKind::InvalidHandle, e),
        };

        let hour_utc = current_hour_utc();
        if let Some(violation) = sender_violation(&to, &self.config.from_number, hour_utc) {
            return SendOutcome::permanent(ErrorKind::Permanent, violation);
        }

        debug!(job_id = %item.job_id, to = %to, "Sending SMS");

        let response = self
            .client
            .post(format!("{}/messages", self.config.base_url.trim_end_matches('/')))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .json(&serde_json::json!({
                "to": to,
                "from": self.config.from_number,
                "body": body,
                "idempotency_key": item.dedup_key(ChannelKind::Sms),
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
                .json::<ProviderResponse>()
                .await
                .ok()
                .and_then(|r| r.id);
            return SendOutcome::Accepted {
                provider_message_id: id,
            };
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            SendOutcome::retryable(format!("Provider {}: {}", status, body_text))
        } else {
            warn!(job_id = %item.job_id, status = %status, "SMS provider rejection");
            SendOutcome::permanent(
                ErrorKind::Permanent,
                format!("Provider {}: {}", status, body_text),
            )
        }
    }
}

fn current_hour_utc() -> u32 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    ((secs / 3600) % 24) as u32
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_broadcast: false,
            supports_attachments: false,
            max_body_bytes: Some(MAX_SMS_LENGTH),
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

/// Map a provider SMS callback status to the internal status
pub fn translate_sms_status(status: &str) -> Option<AttemptStatus> {
    match status {
        "queued" => Some(AttemptStatus::Queued),
        "sent" => Some(AttemptStatus::Sent),
        "delivered" => Some(AttemptStatus::Delivered),
        "failed" | "undelivered" => Some(AttemptStatus::Failed),
        _ => None,
    }
}
