//! ABOUTME: Web API layer: producer routes, webhooks, realtime upgrade
//! ABOUTME: Thin handlers over the orchestrator and repositories

use actix_web::{middleware::Logger, web, App, HttpServer};
use co_config::WebhookSecrets;
use co_core::Result;
use co_db::{DeliveryAttemptRepository, DeviceTokenRepository, InboxItemRepository, SuppressionRepository};
use co_engine::EngineMetrics;
use co_orchestrator::Orchestrator;
use co_realtime::RealtimeState;
use std::sync::Arc;

pub mod error;
pub mod routes;
pub mod signature;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub inbox: InboxItemRepository,
    pub tokens: DeviceTokenRepository,
    pub attempts: DeliveryAttemptRepository,
    pub suppressions: SuppressionRepository,
    pub webhooks: WebhookSecrets,
    pub metrics: Arc<EngineMetrics>,
}

/// Create the application with all routes configured
pub fn create_app(
    state: AppState,
    realtime: web::Data<RealtimeState>,
) -> App<
    impl actix_web::dev::ServiceFactory<
        actix_web::dev::ServiceRequest,
        Config = (),
        Response = actix_web::dev::ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(web::Data::new(state))
        .app_data(realtime)
        .wrap(Logger::default())
        .service(
            web::scope("/api")
                .route("/notifications", web::post().to(routes::notifications::submit))
                .route(
                    "/notifications/bulk",
                    web::post().to(routes::notifications::submit_bulk),
                )
                .route(
                    "/notifications/{id}/status",
                    web::get().to(routes::notifications::status),
                )
                .route(
                    "/notifications/{id}/cancel",
                    web::post().to(routes::notifications::cancel),
                )
                .route("/users/{user_id}/inbox", web::get().to(routes::inbox::list))
                .route(
                    "/users/{user_id}/inbox/read-all",
                    web::patch().to(routes::inbox::mark_all_read),
                )
                .route("/inbox/{id}/read", web::patch().to(routes::inbox::mark_read))
                .route("/inbox/{id}/click", web::post().to(routes::inbox::track_click))
                .route("/inbox/{id}", web::delete().to(routes::inbox::dismiss))
                .route(
                    "/device-tokens",
                    web::post().to(routes::device_tokens::register),
                )
                .route(
                    "/device-tokens/{token}",
                    web::delete().to(routes::device_tokens::remove),
                )
                .route(
                    "/webhooks/{channel}",
                    web::post().to(routes::webhooks::provider_callback),
                ),
        )
        .route("/ws", web::get().to(co_realtime::ws_route))
}

/// Start the web server
pub async fn start_server(
    bind_addr: &str,
    state: AppState,
    realtime: web::Data<RealtimeState>,
) -> Result<()> {
    tracing::info!("Starting web server on {}", bind_addr);

    HttpServer::new(move || create_app(state.clone(), realtime.clone()))
        .bind(bind_addr)
        .map_err(|e| co_core::Error::Config(format!("Failed to bind web server: {}", e)))?
        .run()
        .await
        .map_err(|e| co_core::Error::Config(format!("Web server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use co_core::ChannelKind;
    use co_db::{Db, TemplateRepository, UserPreferenceRepository};
    use co_prefs::PreferenceResolver;
    use co_realtime::SessionRegistry;
    use co_template::Renderer;
    use std::collections::HashMap;
    use std::time::Duration;

    async fn test_state() -> (AppState, web::Data<RealtimeState>) {
        let db = Db::new_in_memory().await.unwrap();

        UserPreferenceRepository::new(db.clone())
            .upsert("u1", ChannelKind::InApp, true, true, None, &HashMap::new())
            .await
            .unwrap();
        TemplateRepository::new(db.clone())
            .upsert("ja-1", ChannelKind::InApp, None, "Hi {{name}}", None, Some("Hello"), None, &[])
            .await
            .unwrap();

        let resolver = Arc::new(PreferenceResolver::new(db.clone()));
        let renderer = Arc::new(Renderer::new(db.clone()));
        let engine = co_engine::DeliveryEngine::new(
            db.clone(),
            resolver.clone(),
            renderer.clone(),
            co_channels::AdapterSet::new(),
            co_engine::EngineSettings::from(&co_config::Config::default()),
        );

        let metrics = engine.metrics();
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            resolver,
            renderer,
            engine.handle(),
            3,
        ));

        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(300)));
        let realtime = web::Data::new(RealtimeState {
            registry,
            inbox: InboxItemRepository::new(db.clone()),
            jwt_secret: "valid32characterjwtsecretfortest".to_string(),
            heartbeat: Duration::from_secs(30),
            backlog_limit: 50,
        });

        let state = AppState {
            orchestrator,
            inbox: InboxItemRepository::new(db.clone()),
            tokens: DeviceTokenRepository::new(db.clone()),
            attempts: DeliveryAttemptRepository::new(db.clone()),
            suppressions: SuppressionRepository::new(db),
            webhooks: WebhookSecrets {
                email_secret: Some("email-secret".to_string()),
                sms_secret: None,
                push_secret: None,
                replay_window_secs: Some(300),
            },
            metrics,
        };
        (state, realtime)
    }

    #[tokio::test]
    async fn test_submit_returns_202_with_id() {
        let (state, realtime) = test_state().await;
        let app = test::init_service(create_app(state, realtime)).await;

        let req = test::TestRequest::post()
            .uri("/api/notifications")
            .set_json(serde_json::json!({
                "user_id": "u1",
                "type": "job_alert",
                "channels": ["in_app"],
                "template_id": "ja-1",
                "variables": {"name": "Ada"}
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), 202);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["notification_id"].is_string());
    }

    #[tokio::test]
    async fn test_submit_validation_is_400() {
        let (state, realtime) = test_state().await;
        let app = test::init_service(create_app(state, realtime)).await;

        let req = test::TestRequest::post()
            .uri("/api/notifications")
            .set_json(serde_json::json!({
                "type": "job_alert",
                "channels": ["in_app"],
                "template_id": "ja-1"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_status_endpoint_roundtrip() {
        let (state, realtime) = test_state().await;
        let app = test::init_service(create_app(state, realtime)).await;

        let req = test::TestRequest::post()
            .uri("/api/notifications")
            .set_json(serde_json::json!({
                "user_id": "u1",
                "type": "job_alert",
                "channels": ["in_app"],
                "template_id": "ja-1"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        let body: serde_json::Value = test::read_body_json(resp).await;
        let id = body["notification_id"].as_str().unwrap();

        let req = test::TestRequest::get()
            .uri(&format!("/api/notifications/{}/status", id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let status: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(status["state"], "in_progress");
        assert_eq!(status["jobs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_device_token_register_and_remove() {
        let (state, realtime) = test_state().await;
        let app = test::init_service(create_app(state, realtime)).await;

        let req = test::TestRequest::post()
            .uri("/api/device-tokens")
            .set_json(serde_json::json!({
                "user_id": "u1",
                "token": "tok-1",
                "platform": "android"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);

        let req = test::TestRequest::delete()
            .uri("/api/device-tokens/tok-1")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 204);

        let req = test::TestRequest::delete()
            .uri("/api/device-tokens/tok-1")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_webhook_rejects_unsigned() {
        let (state, realtime) = test_state().await;
        let app = test::init_service(create_app(state, realtime)).await;

        let req = test::TestRequest::post()
            .uri("/api/webhooks/email")
            .set_payload(r#"{"provider_message_id":"pm-1","event":"delivered"}"#)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn test_webhook_accepts_signed() {
        use crate::signature::sign;

        let (state, realtime) = test_state().await;
        let app = test::init_service(create_app(state, realtime)).await;

        let body = r#"{"provider_message_id":"pm-1","event":"delivered"}"#;
        let signature = sign("email-secret", body.as_bytes());
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let req = test::TestRequest::post()
            .uri("/api/webhooks/email")
            .insert_header(("x-courier-signature", signature))
            .insert_header(("x-courier-timestamp", now.to_string()))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        // Unknown provider message id: verified but not applied
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["handled"], false);
    }

    #[tokio::test]
    async fn test_webhook_applies_delivered_status() {
        use crate::signature::sign;
        use co_db::{AttemptStatus, CreateDeliveryAttempt};

        let (state, realtime) = test_state().await;
        let attempts = state.attempts.clone();
        attempts
            .append(CreateDeliveryAttempt {
                notification_id: "n1".to_string(),
                job_id: "j1".to_string(),
                channel: ChannelKind::Email,
                attempt_index: 1,
                status: AttemptStatus::Sent,
                provider_message_id: Some("pm-77".to_string()),
                error_kind: None,
                error_message: None,
            })
            .await
            .unwrap();

        let app = test::init_service(create_app(state, realtime)).await;

        let body = r#"{"provider_message_id":"pm-77","event":"delivered"}"#;
        let signature = sign("email-secret", body.as_bytes());
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let req = test::TestRequest::post()
            .uri("/api/webhooks/email")
            .insert_header(("x-courier-signature", signature))
            .insert_header(("x-courier-timestamp", now.to_string()))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let response: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(response["handled"], true);

        let row = attempts
            .find_by_job_and_index("j1", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, AttemptStatus::Delivered);
    }

    #[tokio::test]
    async fn test_webhook_channel_without_secret_rejects() {
        let (state, realtime) = test_state().await;
        let app = test::init_service(create_app(state, realtime)).await;

        let body = r#"{"provider_message_id":"pm-1","status":"delivered"}"#;
        let signature = crate::signature::sign("whatever", body.as_bytes());
        let req = test::TestRequest::post()
            .uri("/api/webhooks/sms")
            .insert_header(("x-courier-signature", signature))
            .insert_header(("x-courier-timestamp", "0"))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn test_inbox_flow() {
        let (state, realtime) = test_state().await;
        let inbox = state.inbox.clone();
        let app = test::init_service(create_app(state, realtime)).await;

        let item = inbox
            .create(co_db::CreateInboxItem {
                user_id: "u1".to_string(),
                notification_id: "n1".to_string(),
                kind: "job_alert".to_string(),
                title: "t".to_string(),
                body: "b".to_string(),
                action_url: None,
                icon: None,
                expires_at: None,
            })
            .await
            .unwrap();

        let req = test::TestRequest::get()
            .uri("/api/users/u1/inbox?unread_only=true")
            .to_request();
        let resp = test::call_service(&app, req).await;
        let page: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(page["unread_count"], 1);

        let req = test::TestRequest::patch()
            .uri(&format!("/api/inbox/{}/read", item.id))
            .set_json(serde_json::json!({"user_id": "u1"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::delete()
            .uri(&format!("/api/inbox/{}?user_id=u1", item.id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 204);

        let req = test::TestRequest::get()
            .uri("/api/users/u1/inbox")
            .to_request();
        let resp = test::call_service(&app, req).await;
        let page: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(page["total"], 0);
    }
}
