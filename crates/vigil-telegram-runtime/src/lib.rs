//! Telegram long-poll transport runtime for vigil.
//!
//! Keeps one `getUpdates` long-poll session per account alive indefinitely:
//! supervised restarts with jittered backoff, durable update offsets,
//! failure classification with a fail-open default, and rate-limited
//! out-of-band operator alerts.

pub mod telegram_runtime;

pub use telegram_runtime::*;
