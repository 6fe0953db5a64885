//! ABOUTME: Core types, errors, IDs, and tracing utilities
//! ABOUTME: Foundation crate used by all other courier components

pub mod error;
pub mod id;
pub mod telemetry;
pub mod time;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use id::Id;
pub use time::{to_rfc3339, utc_now, MonotonicTimer};
pub use types::{ChannelKind, Priority};
