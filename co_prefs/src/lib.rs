//! ABOUTME: Preference resolver: allow/deny plus contact handle per channel
//! ABOUTME: Per-type override > channel default > deny; suppression overrides allow

use co_db::{
    Db, DeviceTokenRepository, SuppressionRepository, TtlLruCache, UserPreference,
    UserPreferenceRepository,
};
use co_core::{ChannelKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Contact handle for an allowed channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactHandle {
    /// Email address or phone number
    Address(String),
    /// Active device tokens (push)
    Tokens(Vec<String>),
    /// In-app needs no external handle
    None,
}

/// Why a channel was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoPreference,
    Disabled,
    NotOptedIn,
    TypeOptOut,
    MissingHandle,
    Suppressed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoPreference => "no_preference",
            Self::Disabled => "disabled",
            Self::NotOptedIn => "not_opted_in",
            Self::TypeOptOut => "type_opt_out",
            Self::MissingHandle => "missing_handle",
            Self::Suppressed => "suppressed",
        }
    }
}

/// Resolver output for one (user, kind, channel) question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPreference {
    pub allowed: bool,
    pub handle: ContactHandle,
    pub reason: Option<DenyReason>,
}

impl ResolvedPreference {
    fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            handle: ContactHandle::None,
            reason: Some(reason),
        }
    }

    fn allow(handle: ContactHandle) -> Self {
        Self {
            allowed: true,
            handle,
            reason: None,
        }
    }
}

/// Preference resolver with a 30-minute per-user cache
pub struct PreferenceResolver {
    prefs: UserPreferenceRepository,
    tokens: DeviceTokenRepository,
    suppressions: SuppressionRepository,
    cache: TtlLruCache<Vec<UserPreference>>,
}

impl PreferenceResolver {
    pub fn new(db: Db) -> Self {
        Self {
            prefs: UserPreferenceRepository::new(db.clone()),
            tokens: DeviceTokenRepository::new(db.clone()),
            suppressions: SuppressionRepository::new(db),
            cache: TtlLruCache::new(10_000, Duration::from_secs(30 * 60)),
        }
    }

    /// Decide deliverability of a notification kind to a user on a channel.
    ///
    /// Resolution order: per-type override, then the channel row's
    /// enabled/opt_in flags. Suppression of the resolved handle overrides
    /// an allow.
    pub async fn resolve(
        &self,
        user_id: &str,
        kind: &str,
        channel: ChannelKind,
    ) -> Result<ResolvedPreference> {
        let rows = self.load_user(user_id).await?;
        let Some(pref) = rows.iter().find(|p| p.channel == channel) else {
            return Ok(ResolvedPreference::deny(DenyReason::NoPreference));
        };

        if let Some(false) = pref.type_overrides.get(kind) {
            return Ok(ResolvedPreference::deny(DenyReason::TypeOptOut));
        }
        if !pref.enabled {
            return Ok(ResolvedPreference::deny(DenyReason::Disabled));
        }
        if !pref.opt_in {
            return Ok(ResolvedPreference::deny(DenyReason::NotOptedIn));
        }

        match channel {
            ChannelKind::Email | ChannelKind::Sms => {
                let Some(handle) = pref.handle.as_deref().filter(|h| !h.is_empty()) else {
                    return Ok(ResolvedPreference::deny(DenyReason::MissingHandle));
                };
                if self.suppressions.is_suppressed(channel, handle).await? {
                    debug!(user_id = %user_id, channel = %channel, "Handle on suppression list");
                    return Ok(ResolvedPreference::deny(DenyReason::Suppressed));
                }
                Ok(ResolvedPreference::allow(ContactHandle::Address(
                    handle.to_string(),
                )))
            }
            ChannelKind::Push => {
                // Zero active tokens is an adapter-level failure, not a
                // preference denial; the job is still created
                let tokens = self
                    .tokens
                    .active_for_user(user_id)
                    .await?
                    .into_iter()
                    .map(|t| t.token)
                    .collect();
                Ok(ResolvedPreference::allow(ContactHandle::Tokens(tokens)))
            }
            ChannelKind::InApp => Ok(ResolvedPreference::allow(ContactHandle::None)),
        }
    }

    /// Update a preference row and invalidate the user's cache entry
    pub async fn update(
        &self,
        user_id: &str,
        channel: ChannelKind,
        enabled: bool,
        opt_in: bool,
        handle: Option<&str>,
        type_overrides: &HashMap<String, bool>,
    ) -> Result<()> {
        self.prefs
            .upsert(user_id, channel, enabled, opt_in, handle, type_overrides)
            .await?;
        self.cache.invalidate(user_id);
        Ok(())
    }

    /// Drop a user's cached rows (external mutation path)
    pub fn invalidate_user(&self, user_id: &str) {
        self.cache.invalidate(user_id);
    }

    async fn load_user(&self, user_id: &str) -> Result<Vec<UserPreference>> {
        if let Some(rows) = self.cache.get(user_id) {
            return Ok(rows);
        }
        let rows = self.prefs.list_for_user(user_id).await?;
        self.cache.put(user_id.to_string(), rows.clone());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn resolver_with_email_pref(
        enabled: bool,
        opt_in: bool,
        handle: Option<&str>,
    ) -> PreferenceResolver {
        let db = Db::new_in_memory().await.unwrap();
        let repo = UserPreferenceRepository::new(db.clone());
        repo.upsert("u1", ChannelKind::Email, enabled, opt_in, handle, &HashMap::new())
            .await
            .unwrap();
        PreferenceResolver::new(db)
    }

    #[tokio::test]
    async fn test_allow_with_handle() {
        let resolver = resolver_with_email_pref(true, true, Some("a@x.test")).await;
        let decision = resolver.resolve("u1", "job_alert", ChannelKind::Email).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(
            decision.handle,
            ContactHandle::Address("a@x.test".to_string())
        );
    }

    #[tokio::test]
    async fn test_deny_disabled() {
        let resolver = resolver_with_email_pref(false, true, Some("a@x.test")).await;
        let decision = resolver.resolve("u1", "job_alert", ChannelKind::Email).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::Disabled));
    }

    #[tokio::test]
    async fn test_deny_not_opted_in() {
        let resolver = resolver_with_email_pref(true, false, Some("a@x.test")).await;
        let decision = resolver.resolve("u1", "job_alert", ChannelKind::Email).await.unwrap();
        assert_eq!(decision.reason, Some(DenyReason::NotOptedIn));
    }

    #[tokio::test]
    async fn test_deny_missing_handle() {
        let resolver = resolver_with_email_pref(true, true, None).await;
        let decision = resolver.resolve("u1", "job_alert", ChannelKind::Email).await.unwrap();
        assert_eq!(decision.reason, Some(DenyReason::MissingHandle));
    }

    #[tokio::test]
    async fn test_deny_no_preference_row() {
        let db = Db::new_in_memory().await.unwrap();
        let resolver = PreferenceResolver::new(db);
        let decision = resolver.resolve("u1", "job_alert", ChannelKind::Sms).await.unwrap();
        assert_eq!(decision.reason, Some(DenyReason::NoPreference));
    }

    #[tokio::test]
    async fn test_type_override_beats_channel_default() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = UserPreferenceRepository::new(db.clone());
        let mut overrides = HashMap::new();
        overrides.insert("job_alert".to_string(), false);
        repo.upsert("u1", ChannelKind::Email, true, true, Some("a@x.test"), &overrides)
            .await
            .unwrap();

        let resolver = PreferenceResolver::new(db);
        let denied = resolver.resolve("u1", "job_alert", ChannelKind::Email).await.unwrap();
        assert_eq!(denied.reason, Some(DenyReason::TypeOptOut));

        // Other kinds still use the channel default
        let allowed = resolver.resolve("u1", "digest", ChannelKind::Email).await.unwrap();
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn test_suppression_overrides_allow() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = UserPreferenceRepository::new(db.clone());
        repo.upsert("u1", ChannelKind::Email, true, true, Some("a@x.test"), &HashMap::new())
            .await
            .unwrap();
        SuppressionRepository::new(db.clone())
            .add(ChannelKind::Email, "a@x.test", "hard_bounce")
            .await
            .unwrap();

        let resolver = PreferenceResolver::new(db);
        let decision = resolver.resolve("u1", "job_alert", ChannelKind::Email).await.unwrap();
        assert_eq!(decision.reason, Some(DenyReason::Suppressed));
    }

    #[tokio::test]
    async fn test_push_allows_with_empty_token_set() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = UserPreferenceRepository::new(db.clone());
        repo.upsert("u1", ChannelKind::Push, true, true, None, &HashMap::new())
            .await
            .unwrap();

        let resolver = PreferenceResolver::new(db);
        let decision = resolver.resolve("u1", "job_alert", ChannelKind::Push).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.handle, ContactHandle::Tokens(vec![]));
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_update() {
        let db = Db::new_in_memory().await.unwrap();
        let resolver = PreferenceResolver::new(db);

        resolver
            .update("u1", ChannelKind::Email, true, true, Some("a@x.test"), &HashMap::new())
            .await
            .unwrap();
        assert!(resolver
            .resolve("u1", "job_alert", ChannelKind::Email)
            .await
            .unwrap()
            .allowed);

        // Mutation through the resolver is visible immediately
        resolver
            .update("u1", ChannelKind::Email, false, true, Some("a@x.test"), &HashMap::new())
            .await
            .unwrap();
        let decision = resolver.resolve("u1", "job_alert", ChannelKind::Email).await.unwrap();
        assert_eq!(decision.reason, Some(DenyReason::Disabled));
    }
}
