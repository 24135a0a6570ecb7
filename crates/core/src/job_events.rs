//! Event names used on the realtime job-events connection.
//!
//! Inbound records carry one of these in their `event` field; outbound
//! control messages carry one of the `CONTROL_*` values in `type`.

/// Progress update for a job (`status`/`state`, `progress`).
pub const EVENT_STATUS_UPDATE: &str = "status_update";

/// Job finished; the track bundle can be fetched.
pub const EVENT_PROCESSING_COMPLETE: &str = "processing_complete";

/// Job failed; `error` or `message` holds the reason.
pub const EVENT_PROCESSING_ERROR: &str = "processing_error";

/// Wildcard category: receives every decoded record.
pub const EVENT_MESSAGE: &str = "message";

/// Connection established (local lifecycle event).
pub const EVENT_CONNECT: &str = "connect";

/// Established connection lost (local lifecycle event).
pub const EVENT_DISCONNECT: &str = "disconnect";

/// Reconnect attempts exhausted (local lifecycle event).
pub const EVENT_CONNECTION_ERROR: &str = "error";

/// Ask the server to push events for a job.
pub const CONTROL_SUBSCRIBE: &str = "subscribe";

/// Stop pushing events for a job.
pub const CONTROL_UNSUBSCRIBE: &str = "unsubscribe";
