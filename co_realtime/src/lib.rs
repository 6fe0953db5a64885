//! ABOUTME: Realtime in-app transport: session registry, protocol, WebSocket loop
//! ABOUTME: Ordered per-session delivery over actix-ws with heartbeat and idle drop

pub mod auth;
pub mod protocol;
pub mod registry;
pub mod ws;

pub use auth::validate_session_token;
pub use protocol::{ClientEvent, InboxItemView, ServerEvent};
pub use registry::{SessionRegistry, SessionSnapshot};
pub use ws::{ws_route, RealtimeState};
