//! ABOUTME: Inbox endpoints: list, read, read-all, dismiss, click tracking
//! ABOUTME: All operations are scoped to the owning user

use crate::{error::ApiError, AppState};
use actix_web::{web, HttpResponse};
use co_core::Error;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub unread_only: bool,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct UserScope {
    pub user_id: String,
}

/// GET /api/users/{user_id}/inbox
pub async fn list(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    let page = state
        .inbox
        .list(&path.into_inner(), query.page, query.limit, query.unread_only)
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

/// PATCH /api/inbox/{id}/read
pub async fn mark_read(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UserScope>,
) -> Result<HttpResponse, ApiError> {
    let updated = state.inbox.mark_read(&path.into_inner(), &body.user_id).await?;
    if !updated {
        return Err(ApiError(Error::NotFound("inbox item".to_string())));
    }
    Ok(HttpResponse::Ok().json(json!({ "read": true })))
}

/// PATCH /api/users/{user_id}/inbox/read-all
pub async fn mark_all_read(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let updated = state.inbox.mark_all_read(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "read": updated })))
}

/// POST /api/inbox/{id}/click
pub async fn track_click(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UserScope>,
) -> Result<HttpResponse, ApiError> {
    let updated = state
        .inbox
        .track_click(&path.into_inner(), &body.user_id)
        .await?;
    if !updated {
        return Err(ApiError(Error::NotFound("inbox item".to_string())));
    }
    Ok(HttpResponse::Ok().json(json!({ "clicked": true })))
}

/// DELETE /api/inbox/{id}
pub async fn dismiss(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<UserScope>,
) -> Result<HttpResponse, ApiError> {
    let updated = state.inbox.dismiss(&path.into_inner(), &query.user_id).await?;
    if !updated {
        return Err(ApiError(Error::NotFound("inbox item".to_string())));
    }
    Ok(HttpResponse::NoContent().finish())
}
