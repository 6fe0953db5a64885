//! ABOUTME: Signed provider webhooks closing the delivery loop
//! ABOUTME: HMAC over the raw body, replay-window check, idempotent status writes

use crate::signature::verify;
use crate::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use co_channels::{translate_email_event, translate_sms_status};
use co_core::ChannelKind;
use co_db::AttemptStatus;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const SIGNATURE_HEADER: &str = "x-courier-signature";
const TIMESTAMP_HEADER: &str = "x-courier-timestamp";

#[derive(Debug, Deserialize)]
struct EmailEvent {
    provider_message_id: String,
    event: String,
    #[serde(default)]
    recipient: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusEvent {
    provider_message_id: String,
    status: String,
}

/// POST /api/webhooks/{channel}
///
/// The raw body is consumed as bytes: the HMAC covers the exact payload
/// on the wire.
pub async fn provider_callback(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let channel_name = path.into_inner();
    let Some(channel) = ChannelKind::parse(&channel_name) else {
        return HttpResponse::NotFound().json(json!({ "error": "unknown channel" }));
    };
    if channel == ChannelKind::InApp {
        return HttpResponse::NotFound().json(json!({ "error": "no callbacks for in_app" }));
    }

    let signature = header(&req, SIGNATURE_HEADER).unwrap_or_default();
    let timestamp: i64 = header(&req, TIMESTAMP_HEADER)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let now_secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    if let Err(e) = verify(
        state.webhooks.secret_for(channel),
        &body,
        &signature,
        timestamp,
        now_secs,
        state.webhooks.replay_window(),
    ) {
        warn!(channel = %channel, reason = e.as_str(), "Rejected provider webhook");
        return HttpResponse::Unauthorized().json(json!({ "error": e.as_str() }));
    }

    match channel {
        ChannelKind::Email => handle_email(&state, &body).await,
        ChannelKind::Sms | ChannelKind::Push => handle_status(&state, channel, &body).await,
        ChannelKind::InApp => unreachable!("rejected above"),
    }
}

async fn handle_email(state: &AppState, body: &[u8]) -> HttpResponse {
    let event: EmailEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            return HttpResponse::BadRequest().json(json!({ "error": format!("bad payload: {}", e) }))
        }
    };

    let Some(action) = translate_email_event(&event.event) else {
        debug!(event = %event.event, "Ignoring unknown email event");
        return HttpResponse::Ok().json(json!({ "handled": false }));
    };

    if action.suppress {
        if let Some(recipient) = &event.recipient {
            if let Err(e) = state
                .suppressions
                .add(ChannelKind::Email, recipient, &event.event)
                .await
            {
                warn!(error = %e, "Failed to add suppression from callback");
            }
        }
    }

    apply_status(state, ChannelKind::Email, &event.provider_message_id, action.status).await
}

async fn handle_status(state: &AppState, channel: ChannelKind, body: &[u8]) -> HttpResponse {
    let event: StatusEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => {
            return HttpResponse::BadRequest().json(json!({ "error": format!("bad payload: {}", e) }))
        }
    };

    let Some(status) = translate_sms_status(&event.status) else {
        debug!(status = %event.status, "Ignoring unknown provider status");
        return HttpResponse::Ok().json(json!({ "handled": false }));
    };

    apply_status(state, channel, &event.provider_message_id, status).await
}

async fn apply_status(
    state: &AppState,
    channel: ChannelKind,
    provider_message_id: &str,
    status: AttemptStatus,
) -> HttpResponse {
    match state
        .attempts
        .update_status_by_provider_id(provider_message_id, status)
        .await
    {
        Ok(applied) => {
            if applied {
                let metrics = state.metrics.channel(channel);
                match status {
                    AttemptStatus::Delivered => {
                        metrics.delivered.inc();
                    }
                    AttemptStatus::Bounced => {
                        metrics.bounced.inc();
                    }
                    AttemptStatus::Failed => {
                        metrics.failed.inc();
                    }
                    _ => {}
                }
            }
            HttpResponse::Ok().json(json!({ "handled": applied }))
        }
        Err(e) => {
            warn!(error = %e, "Failed to apply provider callback");
            HttpResponse::InternalServerError().json(json!({ "error": "internal error" }))
        }
    }
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
