//! ABOUTME: Device token registry endpoints for push targeting
//! ABOUTME: Register upserts and reactivates; delete removes outright

use crate::{error::ApiError, AppState};
use actix_web::{web, HttpResponse};
use co_core::{time::now_epoch_ms, Error};
use co_db::{Platform, RegisterDeviceToken};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub user_id: String,
    pub token: String,
    pub platform: String,
}

/// POST /api/device-tokens
pub async fn register(
    state: web::Data<AppState>,
    body: web::Json<RegisterBody>,
) -> Result<HttpResponse, ApiError> {
    if body.user_id.trim().is_empty() || body.token.trim().is_empty() {
        return Err(ApiError(Error::InvalidInput(
            "user_id and token are required".to_string(),
        )));
    }
    let platform = Platform::parse(&body.platform).ok_or_else(|| {
        ApiError(Error::InvalidInput(format!(
            "unknown platform: {}",
            body.platform
        )))
    })?;

    let token = state
        .tokens
        .register(
            RegisterDeviceToken {
                user_id: body.user_id.clone(),
                token: body.token.clone(),
                platform,
            },
            now_epoch_ms(),
        )
        .await?;

    Ok(HttpResponse::Created().json(json!({
        "token": token.token,
        "platform": platform.as_str(),
        "active": token.active,
    })))
}

/// DELETE /api/device-tokens/{token}
pub async fn remove(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let removed = state.tokens.remove(&path.into_inner()).await?;
    if !removed {
        return Err(ApiError(Error::NotFound("device token".to_string())));
    }
    Ok(HttpResponse::NoContent().finish())
}
