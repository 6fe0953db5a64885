//! ABOUTME: Delivery engine: claims persistent jobs, batches, rate-limits,
//! ABOUTME: dispatches to channel adapters, and settles outcomes with retries

pub mod backoff;
pub mod batcher;
pub mod engine;
pub mod metrics;
pub mod rate_limit;

pub use backoff::retry_delay;
pub use batcher::Batcher;
pub use engine::{DeliveryEngine, EngineHandle, EngineSettings};
pub use metrics::{ChannelMetrics, EngineMetrics};
pub use rate_limit::{SlidingWindow, UserRateLimiter};
