//! ABOUTME: Wire protocol for the in-app realtime stream
//! ABOUTME: Tagged client/server event enums; the transport preserves order per session

use co_db::InboxItem;
use serde::{Deserialize, Serialize};

/// Inbox item as sent over the realtime stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxItemView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
    pub action_url: Option<String>,
    pub icon: Option<String>,
    pub created_at: String,
    pub read: bool,
}

impl From<InboxItem> for InboxItemView {
    fn from(item: InboxItem) -> Self {
        Self {
            id: item.id,
            kind: item.kind,
            title: item.title,
            body: item.body,
            action_url: item.action_url,
            icon: item.icon,
            created_at: item.created_at,
            read: item.read_at.is_some(),
        }
    }
}

/// Client-to-server events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    Activity,
    NotificationRead {
        id: String,
    },
    NotificationClicked {
        id: String,
    },
    NotificationDismissed {
        id: String,
    },
    GetNotifications {
        #[serde(default = "default_page")]
        page: i64,
        #[serde(default = "default_limit")]
        limit: i64,
        #[serde(default)]
        unread_only: bool,
    },
    MarkAllRead,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

/// Server-to-client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated {
        session_id: String,
        user_id: String,
    },
    PendingNotifications {
        items: Vec<InboxItemView>,
    },
    Notification {
        item: InboxItemView,
    },
    UnreadCount {
        count: i64,
    },
    NotificationRead {
        id: String,
    },
    Notifications {
        items: Vec<InboxItemView>,
        total: i64,
        unread_count: i64,
    },
    NotificationsAllRead,
    Error {
        message: String,
    },
}
