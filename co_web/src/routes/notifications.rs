//! ABOUTME: Producer endpoints: submit, bulk submit, cancel, and status
//! ABOUTME: Accepting returns 202; delivery is asynchronous

use crate::{error::ApiError, AppState};
use actix_web::{web, HttpResponse};
use co_orchestrator::NotificationRequest;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Producer request body: `user_id` for one recipient, `user_ids` to fan
/// the same notification out to several.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitBody {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(flatten)]
    pub request: SubmitFields,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitFields {
    #[serde(rename = "type")]
    pub kind: String,
    pub channels: Vec<co_core::ChannelKind>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub variables: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<co_core::Priority>,
    #[serde(default)]
    pub scheduled_for: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub metadata: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    pub persistent: Option<bool>,
}

impl SubmitBody {
    fn recipients(&self) -> Result<Vec<String>, ApiError> {
        let mut recipients = Vec::new();
        if let Some(user_id) = &self.user_id {
            recipients.push(user_id.clone());
        }
        recipients.extend(self.user_ids.iter().cloned());
        if recipients.is_empty() {
            return Err(ApiError(co_core::Error::InvalidInput(
                "user_id or user_ids is required".to_string(),
            )));
        }
        Ok(recipients)
    }

    fn to_request(&self, user_id: String) -> NotificationRequest {
        NotificationRequest {
            user_id,
            kind: self.request.kind.clone(),
            channels: self.request.channels.clone(),
            template_id: self.request.template_id.clone(),
            variables: self.request.variables.clone(),
            payload: self.request.payload.clone(),
            priority: self.request.priority.unwrap_or(co_core::Priority::Normal),
            scheduled_for: self.request.scheduled_for,
            expires_at: self.request.expires_at,
            metadata: self.request.metadata.clone(),
            persistent: self.request.persistent.unwrap_or(true),
        }
    }
}

#[derive(Debug, Serialize)]
struct BulkItemResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// POST /api/notifications
pub async fn submit(
    state: web::Data<AppState>,
    body: web::Json<SubmitBody>,
) -> Result<HttpResponse, ApiError> {
    let mut recipients = body.recipients()?;

    if recipients.len() == 1 {
        let user_id = recipients.remove(0);
        let id = state.orchestrator.submit(body.to_request(user_id)).await?;
        return Ok(HttpResponse::Accepted().json(json!({ "notification_id": id })));
    }

    let requests = recipients
        .into_iter()
        .map(|user_id| body.to_request(user_id))
        .collect();
    let results = state.orchestrator.submit_bulk(requests).await;
    let ids: Vec<BulkItemResult> = results.into_iter().map(to_bulk_item).collect();
    Ok(HttpResponse::Accepted().json(json!({ "notifications": ids })))
}

/// POST /api/notifications/bulk
#[derive(Debug, Deserialize)]
pub struct BulkBody {
    pub items: Vec<SubmitBody>,
}

pub async fn submit_bulk(
    state: web::Data<AppState>,
    body: web::Json<BulkBody>,
) -> Result<HttpResponse, ApiError> {
    let mut requests = Vec::new();
    let mut early_errors: Vec<(usize, String)> = Vec::new();

    for (index, item) in body.items.iter().enumerate() {
        match item.recipients() {
            Ok(recipients) => {
                for user_id in recipients {
                    requests.push((index, item.to_request(user_id)));
                }
            }
            Err(e) => early_errors.push((index, e.to_string())),
        }
    }

    let results = state
        .orchestrator
        .submit_bulk(requests.iter().map(|(_, r)| r.clone()).collect())
        .await;

    let mut items: Vec<BulkItemResult> = results.into_iter().map(to_bulk_item).collect();
    for (_, error) in early_errors {
        items.push(BulkItemResult {
            notification_id: None,
            error: Some(error),
        });
    }

    Ok(HttpResponse::Accepted().json(json!({ "results": items })))
}

/// GET /api/notifications/{id}/status
pub async fn status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let status = state.orchestrator.status(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(status))
}

/// POST /api/notifications/{id}/cancel
pub async fn cancel(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let cancelled = state.orchestrator.cancel(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "cancelled_jobs": cancelled })))
}

fn to_bulk_item(result: co_core::Result<String>) -> BulkItemResult {
    match result {
        Ok(id) => BulkItemResult {
            notification_id: Some(id),
            error: None,
        },
        Err(e) => BulkItemResult {
            notification_id: None,
            error: Some(e.to_string()),
        },
    }
}
