//! ABOUTME: HTTP handler implementations for the producer-facing API
//! ABOUTME: One module per resource; routing wiring lives in the crate root

pub mod device_tokens;
pub mod inbox;
pub mod notifications;
pub mod webhooks;
