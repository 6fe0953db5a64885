//! ABOUTME: Repository structs, one per table, with runtime-checked queries
//! ABOUTME: Each repository owns row mapping and transition rules for its entity

pub mod delivery_attempts;
pub mod delivery_jobs;
pub mod device_tokens;
pub mod inbox_items;
pub mod notifications;
pub mod suppressions;
pub mod templates;
pub mod user_preferences;
