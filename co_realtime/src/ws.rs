//! ABOUTME: WebSocket session loop for the in-app realtime stream
//! ABOUTME: One task per connection; outbound events flow through an ordered channel

use crate::auth::validate_session_token;
use crate::protocol::{ClientEvent, InboxItemView, ServerEvent};
use crate::registry::SessionRegistry;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use co_core::Id;
use co_db::InboxItemRepository;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared state for the realtime endpoint
pub struct RealtimeState {
    pub registry: Arc<SessionRegistry>,
    pub inbox: InboxItemRepository,
    pub jwt_secret: String,
    pub heartbeat: Duration,
    /// Unread items replayed on reconnect
    pub backlog_limit: i64,
}

/// WebSocket upgrade handler; spawns the per-session task
pub async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<RealtimeState>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    let remote_addr = req
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    actix_web::rt::spawn(run_session(
        session,
        msg_stream,
        state.into_inner(),
        remote_addr,
    ));

    Ok(response)
}

async fn run_session(
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    state: Arc<RealtimeState>,
    remote_addr: String,
) {
    let session_id = Id::new().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut user_id: Option<String> = None;
    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(session_id = %session_id, remote_addr = %remote_addr, "Realtime connection opened");

    loop {
        tokio::select! {
            msg = msg_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if user_id.is_some() {
                            state.registry.touch(&session_id).await;
                        }
                        let event = match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                let _ = tx.send(ServerEvent::Error {
                                    message: format!("Malformed event: {}", e),
                                });
                                continue;
                            }
                        };
                        if let Err(()) = handle_client_event(
                            event,
                            &session_id,
                            &remote_addr,
                            &mut user_id,
                            &tx,
                            &state,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        if user_id.is_some() {
                            state.registry.touch(&session_id).await;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => {
                        debug!(session_id = %session_id, ?reason, "Client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "WebSocket protocol error");
                        break;
                    }
                    None => break,
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(session_id = %session_id, error = %e, "Failed to encode event");
                                continue;
                            }
                        };
                        if session.text(json).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if session.ping(b"").await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.remove(&session_id).await;
    let _ = session.close(None).await;
    info!(session_id = %session_id, "Realtime connection closed");
}

async fn handle_client_event(
    event: ClientEvent,
    session_id: &str,
    remote_addr: &str,
    user_id: &mut Option<String>,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    state: &Arc<RealtimeState>,
) -> std::result::Result<(), ()> {
    if let ClientEvent::Authenticate { token } = &event {
        match validate_session_token(token, &state.jwt_secret) {
            Ok(authenticated) => {
                *user_id = Some(authenticated.clone());
                state
                    .registry
                    .register(session_id, &authenticated, remote_addr, tx.clone())
                    .await;

                let _ = tx.send(ServerEvent::Authenticated {
                    session_id: session_id.to_string(),
                    user_id: authenticated.clone(),
                });

                // Reconnect backlog: the most recent unread items, so a
                // returning client recovers state without duplicates
                match state.inbox.unread(&authenticated, state.backlog_limit).await {
                    Ok(items) => {
                        let _ = tx.send(ServerEvent::PendingNotifications {
                            items: items.into_iter().map(InboxItemView::from).collect(),
                        });
                    }
                    Err(e) => {
                        warn!(user_id = %authenticated, error = %e, "Failed to load backlog");
                    }
                }
                send_unread_count(&authenticated, tx, state).await;
            }
            Err(e) => {
                let _ = tx.send(ServerEvent::Error {
                    message: e.to_string(),
                });
                // Unauthenticated connections get one shot
                return Err(());
            }
        }
        return Ok(());
    }

    let Some(user) = user_id.as_deref() else {
        let _ = tx.send(ServerEvent::Error {
            message: "Not authenticated".to_string(),
        });
        return Ok(());
    };

    match event {
        ClientEvent::Authenticate { .. } => unreachable!("handled above"),
        ClientEvent::Activity => {
            state.registry.touch(session_id).await;
        }
        ClientEvent::NotificationRead { id } => {
            match state.inbox.mark_read(&id, user).await {
                Ok(true) => {
                    // Sync every session of the user
                    state
                        .registry
                        .send_to_user(user, &ServerEvent::NotificationRead { id })
                        .await;
                    broadcast_unread_count(user, state).await;
                }
                Ok(false) => {
                    let _ = tx.send(ServerEvent::Error {
                        message: "Notification not found".to_string(),
                    });
                }
                Err(e) => {
                    let _ = tx.send(ServerEvent::Error { message: e.to_string() });
                }
            }
        }
        ClientEvent::NotificationClicked { id } => {
            if let Err(e) = state.inbox.track_click(&id, user).await {
                let _ = tx.send(ServerEvent::Error { message: e.to_string() });
            } else {
                broadcast_unread_count(user, state).await;
            }
        }
        ClientEvent::NotificationDismissed { id } => {
            match state.inbox.dismiss(&id, user).await {
                Ok(_) => broadcast_unread_count(user, state).await,
                Err(e) => {
                    let _ = tx.send(ServerEvent::Error { message: e.to_string() });
                }
            }
        }
        ClientEvent::GetNotifications {
            page,
            limit,
            unread_only,
        } => match state.inbox.list(user, page, limit, unread_only).await {
            Ok(result) => {
                let _ = tx.send(ServerEvent::Notifications {
                    items: result.items.into_iter().map(InboxItemView::from).collect(),
                    total: result.total,
                    unread_count: result.unread_count,
                });
            }
            Err(e) => {
                let _ = tx.send(ServerEvent::Error { message: e.to_string() });
            }
        },
        ClientEvent::MarkAllRead => match state.inbox.mark_all_read(user).await {
            Ok(_) => {
                state
                    .registry
                    .send_to_user(user, &ServerEvent::NotificationsAllRead)
                    .await;
                broadcast_unread_count(user, state).await;
            }
            Err(e) => {
                let _ = tx.send(ServerEvent::Error { message: e.to_string() });
            }
        },
    }

    Ok(())
}

async fn send_unread_count(
    user: &str,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    state: &Arc<RealtimeState>,
) {
    if let Ok(count) = state.inbox.unread_count(user).await {
        let _ = tx.send(ServerEvent::UnreadCount { count });
    }
}

async fn broadcast_unread_count(user: &str, state: &Arc<RealtimeState>) {
    if let Ok(count) = state.inbox.unread_count(user).await {
        state
            .registry
            .send_to_user(user, &ServerEvent::UnreadCount { count })
            .await;
    }
}
