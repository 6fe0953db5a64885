//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles all delivery-pipeline settings from environment variables and files

use co_core::{ChannelKind, Error, Priority, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::Validate;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub queue: QueueConfig,
    #[validate(nested)]
    pub retry: RetryConfig,
    #[validate(nested)]
    pub rate: RateConfig,
    #[validate(nested)]
    pub session: SessionConfig,
    #[validate(nested)]
    pub inbox: InboxConfig,
    #[validate(nested)]
    pub adapter: AdapterConfig,
    #[validate(nested)]
    pub drain: DrainConfig,
    #[validate(nested)]
    pub realtime: RealtimeConfig,
    #[validate(nested)]
    pub providers: ProvidersConfig,
    pub webhooks: WebhookSecrets,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    #[validate(range(min = 1, max = 65535))]
    pub obs_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            obs_port: 9000,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub path: String,
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,
    pub sqlite_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "courier.db".to_string(),
            pool_size: 10,
            sqlite_wal: true,
        }
    }
}

/// Per-channel worker pool sizes
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ConcurrencyConfig {
    #[validate(range(min = 1, max = 256))]
    pub email: usize,
    #[validate(range(min = 1, max = 256))]
    pub sms: usize,
    #[validate(range(min = 1, max = 256))]
    pub push: usize,
    #[validate(range(min = 1, max = 256))]
    pub in_app: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            email: 20,
            sms: 5,
            push: 15,
            in_app: 50,
        }
    }
}

/// Batch sizes for the batching tiers (urgent/high never batch)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BatchSizeConfig {
    #[validate(range(min = 1, max = 10000))]
    pub email_normal: usize,
    #[validate(range(min = 1, max = 10000))]
    pub email_low: usize,
    #[validate(range(min = 1, max = 10000))]
    pub sms_normal: usize,
    #[validate(range(min = 1, max = 10000))]
    pub sms_low: usize,
    #[validate(range(min = 1, max = 10000))]
    pub push_normal: usize,
    #[validate(range(min = 1, max = 10000))]
    pub push_low: usize,
}

impl Default for BatchSizeConfig {
    fn default() -> Self {
        Self {
            email_normal: 50,
            email_low: 100,
            sms_normal: 20,
            sms_low: 50,
            push_normal: 100,
            push_low: 200,
        }
    }
}

/// Flush timeouts for the batching tiers, in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct FlushMsConfig {
    #[validate(range(min = 100, max = 600000))]
    pub email_normal: u64,
    #[validate(range(min = 100, max = 600000))]
    pub email_low: u64,
    #[validate(range(min = 100, max = 600000))]
    pub sms_normal: u64,
    #[validate(range(min = 100, max = 600000))]
    pub sms_low: u64,
    #[validate(range(min = 100, max = 600000))]
    pub push_normal: u64,
    #[validate(range(min = 100, max = 600000))]
    pub push_low: u64,
}

impl Default for FlushMsConfig {
    fn default() -> Self {
        Self {
            email_normal: 30_000,
            email_low: 60_000,
            sms_normal: 15_000,
            sms_low: 30_000,
            push_normal: 10_000,
            push_low: 30_000,
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct QueueConfig {
    #[validate(nested)]
    pub concurrency: ConcurrencyConfig,
    #[validate(nested)]
    pub batch_size: BatchSizeConfig,
    #[validate(nested)]
    pub flush_ms: FlushMsConfig,
}

/// Resolved batching policy for one (channel, priority) queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Maximum items per dispatched batch
    pub max_size: usize,
    /// Flush the partial batch after this long
    pub flush_after: Duration,
}

impl QueueConfig {
    /// Worker pool size for a channel
    pub fn concurrency(&self, channel: ChannelKind) -> usize {
        match channel {
            ChannelKind::Email => self.concurrency.email,
            ChannelKind::Sms => self.concurrency.sms,
            ChannelKind::Push => self.concurrency.push,
            ChannelKind::InApp => self.concurrency.in_app,
        }
    }

    /// Batching policy for a (channel, priority) queue.
    ///
    /// Urgent and high tiers, and everything on the in-app channel,
    /// dispatch immediately with batch size 1.
    pub fn batch_policy(&self, channel: ChannelKind, priority: Priority) -> BatchPolicy {
        if priority.bypasses_batching() || channel == ChannelKind::InApp {
            return BatchPolicy {
                max_size: 1,
                flush_after: Duration::ZERO,
            };
        }

        let (size, flush_ms) = match (channel, priority) {
            (ChannelKind::Email, Priority::Normal) => {
                (self.batch_size.email_normal, self.flush_ms.email_normal)
            }
            (ChannelKind::Email, Priority::Low) => {
                (self.batch_size.email_low, self.flush_ms.email_low)
            }
            (ChannelKind::Sms, Priority::Normal) => {
                (self.batch_size.sms_normal, self.flush_ms.sms_normal)
            }
            (ChannelKind::Sms, Priority::Low) => (self.batch_size.sms_low, self.flush_ms.sms_low),
            (ChannelKind::Push, Priority::Normal) => {
                (self.batch_size.push_normal, self.flush_ms.push_normal)
            }
            (ChannelKind::Push, Priority::Low) => {
                (self.batch_size.push_low, self.flush_ms.push_low)
            }
            // Covered by the early return above
            _ => (1, 0),
        };

        BatchPolicy {
            max_size: size,
            flush_after: Duration::from_millis(flush_ms),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RetryConfig {
    #[validate(range(min = 1, max = 20))]
    pub attempts: u32,
    #[validate(range(min = 1, max = 3600000))]
    pub base_ms: u64,
    #[validate(range(min = 1, max = 3600000))]
    pub cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_ms: 1_000,
            cap_ms: 300_000,
        }
    }
}

/// Sliding-window rate limits, per minute
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RateConfig {
    #[validate(range(min = 1, max = 1000000))]
    pub email_per_min: u32,
    #[validate(range(min = 1, max = 1000000))]
    pub sms_per_min: u32,
    #[validate(range(min = 1, max = 1000000))]
    pub push_per_min: u32,
    /// In-app is limited per user, not globally
    #[validate(range(min = 1, max = 1000000))]
    pub in_app_per_user_per_min: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            email_per_min: 300,
            sms_per_min: 100,
            push_per_min: 1000,
            in_app_per_user_per_min: 500,
        }
    }
}

impl RateConfig {
    pub fn per_min(&self, channel: ChannelKind) -> u32 {
        match channel {
            ChannelKind::Email => self.email_per_min,
            ChannelKind::Sms => self.sms_per_min,
            ChannelKind::Push => self.push_per_min,
            ChannelKind::InApp => self.in_app_per_user_per_min,
        }
    }
}

/// Realtime session settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SessionConfig {
    #[validate(range(min = 1000, max = 3600000))]
    pub idle_timeout_ms: u64,
    #[validate(range(min = 1000, max = 600000))]
    pub heartbeat_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            heartbeat_ms: 30_000,
        }
    }
}

/// In-app inbox settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct InboxConfig {
    #[validate(range(min = 1, max = 3650))]
    pub retention_days: u32,
    /// Unread items replayed to a session on reconnect
    #[validate(range(min = 1, max = 1000))]
    pub reconnect_backlog: u32,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            reconnect_backlog: 50,
        }
    }
}

/// Adapter call settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AdapterConfig {
    #[validate(range(min = 100, max = 600000))]
    pub timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl AdapterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Visibility timeout for in-flight leases: adapter timeout x 3
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.saturating_mul(3))
    }
}

/// Shutdown drain settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DrainConfig {
    #[validate(range(min = 100, max = 600000))]
    pub timeout_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Realtime transport configuration with secret redaction
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct RealtimeConfig {
    #[validate(length(min = 32))]
    pub jwt_secret: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        // Generate a random secret by default for security
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        Self {
            jwt_secret: format!("INSECURE-RANDOM-{}-CHANGE-IN-PRODUCTION", timestamp),
        }
    }
}

impl fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("jwt_secret", &"[REDACTED]")
            .finish()
    }
}

/// External provider configuration with secret redaction
#[derive(Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    #[validate(nested)]
    pub smtp: Option<SmtpConfig>,
    #[validate(nested)]
    pub sms: Option<SmsProviderConfig>,
    #[validate(nested)]
    pub push: Option<PushProviderConfig>,
}

impl fmt::Debug for ProvidersConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidersConfig")
            .field("smtp", &self.smtp.as_ref().map(|_| "[REDACTED]"))
            .field("sms", &self.sms.as_ref().map(|_| "[REDACTED]"))
            .field("push", &self.push.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// SMTP configuration
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct SmtpConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    #[validate(length(min = 1))]
    pub username: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[validate(email)]
    pub from_address: String,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from_address", &self.from_address)
            .finish()
    }
}

/// SMS provider configuration (HTTP API)
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct SmsProviderConfig {
    #[validate(url)]
    pub base_url: String,
    #[validate(length(min = 1))]
    pub account_sid: String,
    #[validate(length(min = 1))]
    pub auth_token: String,
    #[validate(length(min = 1))]
    pub from_number: String,
    /// Country calling code prepended to unambiguous national numbers
    #[validate(length(min = 1, max = 4))]
    pub default_country_code: String,
}

impl fmt::Debug for SmsProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmsProviderConfig")
            .field("base_url", &self.base_url)
            .field("account_sid", &"[REDACTED]")
            .field("auth_token", &"[REDACTED]")
            .field("from_number", &self.from_number)
            .field("default_country_code", &self.default_country_code)
            .finish()
    }
}

/// Push provider configuration (HTTP API)
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct PushProviderConfig {
    #[validate(url)]
    pub base_url: String,
    #[validate(length(min = 1))]
    pub api_key: String,
}

impl fmt::Debug for PushProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Shared secrets for inbound provider webhooks
#[derive(Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WebhookSecrets {
    pub email_secret: Option<String>,
    pub sms_secret: Option<String>,
    pub push_secret: Option<String>,
    pub replay_window_secs: Option<u64>,
}

impl WebhookSecrets {
    pub fn secret_for(&self, channel: ChannelKind) -> Option<&str> {
        match channel {
            ChannelKind::Email => self.email_secret.as_deref(),
            ChannelKind::Sms => self.sms_secret.as_deref(),
            ChannelKind::Push => self.push_secret.as_deref(),
            ChannelKind::InApp => None,
        }
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.replay_window_secs.unwrap_or(300))
    }
}

impl fmt::Debug for WebhookSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSecrets")
            .field("email_secret", &self.email_secret.as_ref().map(|_| "[REDACTED]"))
            .field("sms_secret", &self.sms_secret.as_ref().map(|_| "[REDACTED]"))
            .field("push_secret", &self.push_secret.as_ref().map(|_| "[REDACTED]"))
            .field("replay_window_secs", &self.replay_window_secs)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables and optional .env file
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Set defaults first
        builder = builder
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.obs_port", 9000)?
            .set_default("database.path", "courier.db")?
            .set_default("database.pool_size", 10)?
            .set_default("database.sqlite_wal", true)?
            .set_default("queue.concurrency.email", 20)?
            .set_default("queue.concurrency.sms", 5)?
            .set_default("queue.concurrency.push", 15)?
            .set_default("queue.concurrency.in_app", 50)?
            .set_default("queue.batch_size.email_normal", 50)?
            .set_default("queue.batch_size.email_low", 100)?
            .set_default("queue.batch_size.sms_normal", 20)?
            .set_default("queue.batch_size.sms_low", 50)?
            .set_default("queue.batch_size.push_normal", 100)?
            .set_default("queue.batch_size.push_low", 200)?
            .set_default("queue.flush_ms.email_normal", 30000)?
            .set_default("queue.flush_ms.email_low", 60000)?
            .set_default("queue.flush_ms.sms_normal", 15000)?
            .set_default("queue.flush_ms.sms_low", 30000)?
            .set_default("queue.flush_ms.push_normal", 10000)?
            .set_default("queue.flush_ms.push_low", 30000)?
            .set_default("retry.attempts", 3)?
            .set_default("retry.base_ms", 1000)?
            .set_default("retry.cap_ms", 300000)?
            .set_default("rate.email_per_min", 300)?
            .set_default("rate.sms_per_min", 100)?
            .set_default("rate.push_per_min", 1000)?
            .set_default("rate.in_app_per_user_per_min", 500)?
            .set_default("session.idle_timeout_ms", 300000)?
            .set_default("session.heartbeat_ms", 30000)?
            .set_default("inbox.retention_days", 90)?
            .set_default("inbox.reconnect_backlog", 50)?
            .set_default("adapter.timeout_ms", 10000)?
            .set_default("drain.timeout_ms", 30000)?;

        // Handle nested environment variables that don't work with the standard separator
        if let Ok(jwt_secret) = std::env::var("COURIER_REALTIME_JWT_SECRET") {
            builder = builder.set_override("realtime.jwt_secret", jwt_secret)?;
        } else {
            let default_jwt_secret = format!(
                "INSECURE-RANDOM-{}-CHANGE-IN-PRODUCTION",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos()
            );
            builder = builder.set_default("realtime.jwt_secret", default_jwt_secret)?;
        }

        if let Ok(pool_size) = std::env::var("COURIER_DATABASE_POOL_SIZE") {
            builder = builder.set_override("database.pool_size", pool_size)?;
        }

        if let Ok(obs_port) = std::env::var("COURIER_SERVER_OBS_PORT") {
            builder = builder.set_override("server.obs_port", obs_port)?;
        }

        // Try to load from .env file if it exists (optional)
        if std::path::Path::new(".env").exists() {
            builder = builder.add_source(File::with_name(".env").required(false));
        }

        // Load from environment variables with COURIER_ prefix (highest priority)
        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .try_parsing(true)
                .separator("_"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}
