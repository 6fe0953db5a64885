//! ABOUTME: Authoritative session table plus user-to-sessions index
//! ABOUTME: Both maps live under one lock and are always updated together

use crate::protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Read-only view of one session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub remote_addr: String,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

struct SessionEntry {
    user_id: String,
    remote_addr: String,
    connected_at: Instant,
    last_activity: Instant,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    by_user: HashMap<String, HashSet<String>>,
}

/// Live session registry.
///
/// The session table and the `user -> sessions` index are mutated only
/// under the same write lock; fan-out takes a read snapshot.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Register an authenticated session and its outbound channel
    pub async fn register(
        &self,
        session_id: &str,
        user_id: &str,
        remote_addr: &str,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                user_id: user_id.to_string(),
                remote_addr: remote_addr.to_string(),
                connected_at: now,
                last_activity: now,
                tx,
            },
        );
        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.to_string());

        debug!(session_id = %session_id, user_id = %user_id, "Session registered");
    }

    /// Drop a session and all of its session-scoped state.
    ///
    /// The index entry is removed in the same critical section.
    pub async fn remove(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.remove(session_id) {
            if let Some(set) = inner.by_user.get_mut(&entry.user_id) {
                set.remove(session_id);
                if set.is_empty() {
                    inner.by_user.remove(&entry.user_id);
                }
            }
            debug!(session_id = %session_id, user_id = %entry.user_id, "Session removed");
        }
    }

    /// Refresh a session's activity clock
    pub async fn touch(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Emit an event to every active session of a user.
    ///
    /// A session counts as active when its last activity is within the
    /// idle timeout. Returns the number of sessions reached.
    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        let inner = self.inner.read().await;
        let Some(session_ids) = inner.by_user.get(user_id) else {
            return 0;
        };

        let mut delivered = 0;
        for session_id in session_ids {
            let Some(entry) = inner.sessions.get(session_id) else {
                continue;
            };
            if entry.last_activity.elapsed() > self.idle_timeout {
                continue;
            }
            if entry.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(session_id = %session_id, "Send to closed session channel");
            }
        }
        delivered
    }

    /// Emit an event to one session
    pub async fn send_to_session(&self, session_id: &str, event: ServerEvent) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(session_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Whether a user has at least one active session
    pub async fn has_active_session(&self, user_id: &str) -> bool {
        let inner = self.inner.read().await;
        let Some(session_ids) = inner.by_user.get(user_id) else {
            return false;
        };
        session_ids.iter().any(|id| {
            inner
                .sessions
                .get(id)
                .map(|e| e.last_activity.elapsed() <= self.idle_timeout)
                .unwrap_or(false)
        })
    }

    /// Total registered sessions (active or idle)
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Snapshot of a user's sessions, for diagnostics
    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<SessionSnapshot> {
        let inner = self.inner.read().await;
        let Some(session_ids) = inner.by_user.get(user_id) else {
            return Vec::new();
        };
        session_ids
            .iter()
            .filter_map(|id| {
                inner.sessions.get(id).map(|e| SessionSnapshot {
                    session_id: id.clone(),
                    user_id: e.user_id.clone(),
                    remote_addr: e.remote_addr.clone(),
                    connected_at: e.connected_at,
                    last_activity: e.last_activity,
                })
            })
            .collect()
    }

    /// Drop sessions idle past the timeout; returns the dropped ids.
    ///
    /// Their outbound channels close, which ends the per-session task.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let idle: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, e)| e.last_activity.elapsed() > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &idle {
            if let Some(entry) = inner.sessions.remove(session_id) {
                if let Some(set) = inner.by_user.get_mut(&entry.user_id) {
                    set.remove(session_id);
                    if set.is_empty() {
                        inner.by_user.remove(&entry.user_id);
                    }
                }
            }
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<ServerEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_register_and_fan_out() {
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let (tx_other, mut rx_other) = channel();

        registry.register("s1", "u1", "127.0.0.1", tx1).await;
        registry.register("s2", "u1", "127.0.0.1", tx2).await;
        registry.register("s3", "u2", "127.0.0.1", tx_other).await;

        let delivered = registry
            .send_to_user("u1", &ServerEvent::UnreadCount { count: 1 })
            .await;
        assert_eq!(delivered, 2);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_updates_both_maps() {
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let (tx, _rx) = channel();
        registry.register("s1", "u1", "127.0.0.1", tx).await;
        assert!(registry.has_active_session("u1").await);

        registry.remove("s1").await;
        assert!(!registry.has_active_session("u1").await);
        assert_eq!(registry.session_count().await, 0);
        assert_eq!(
            registry
                .send_to_user("u1", &ServerEvent::UnreadCount { count: 0 })
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_idle_sessions_not_reached() {
        let registry = SessionRegistry::new(Duration::from_millis(10));
        let (tx, mut rx) = channel();
        registry.register("s1", "u1", "127.0.0.1", tx).await;

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!registry.has_active_session("u1").await);
        let delivered = registry
            .send_to_user("u1", &ServerEvent::UnreadCount { count: 1 })
            .await;
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());

        // Activity revives the session
        registry.touch("s1").await;
        assert!(registry.has_active_session("u1").await);
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let registry = SessionRegistry::new(Duration::from_millis(10));
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        registry.register("stale", "u1", "127.0.0.1", tx1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.register("fresh", "u2", "127.0.0.1", tx2).await;

        let dropped = registry.sweep_idle().await;
        assert_eq!(dropped, vec!["stale".to_string()]);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_multiple_sessions_per_user_permitted() {
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let (tx1, _r1) = channel();
        let (tx2, _r2) = channel();
        registry.register("s1", "u1", "10.0.0.1", tx1).await;
        registry.register("s2", "u1", "10.0.0.2", tx2).await;

        let sessions = registry.sessions_for_user("u1").await;
        assert_eq!(sessions.len(), 2);
    }
}
