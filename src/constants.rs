use std::time::Duration;

/// Upper bound for one NDJSON record; longer lines are dropped.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Hard cap on records per session.
pub const MAX_STREAM_RECORDS: usize = 100_000;

/// Recovery polling defaults
pub const RECOVERY_MAX_ATTEMPTS: u32 = 8;
pub const RECOVERY_POLL_INTERVAL: Duration = Duration::from_millis(650);

/// No record for this long while foregrounded forces an interruption check.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(8);

/// Auxiliary indicator auto-expiry windows
pub const INDICATOR_COMPLETE_WINDOW: Duration = Duration::from_millis(4500);
pub const INDICATOR_ERROR_WINDOW: Duration = Duration::from_secs(6);

/// Capacity of the controller's event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error codes that map to `UsageLimitExceeded`.
pub const USAGE_LIMIT_CODES: &[&str] = &["usage_limit_exceeded", "rate_limit_exceeded"];

/// Environment variable carrying the bearer token for the inference service.
pub const API_KEY_ENV: &str = "STREAMKEEPER_API_KEY";

/// Store records older than session start minus this are from an earlier turn.
pub const STORE_CLOCK_SKEW: Duration = Duration::from_secs(30);
