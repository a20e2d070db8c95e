use std::time::Duration;

/// Connection retrier defaults
pub const MAX_STREAM_ATTEMPTS: u32 = 3;
pub const BASE_BACKOFF: Duration = Duration::from_millis(250);
pub const MAX_BACKOFF: Duration = Duration::from_secs(4);
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
pub const RECONNECTED_DISPLAY: Duration = Duration::from_secs(2);

/// Token pipeline quiescence window for the debounced policy
pub const TOKEN_DEBOUNCE_WINDOW: Duration = Duration::from_millis(30);

/// Narration
pub const STAGE_MIN_DWELL: Duration = Duration::from_millis(600);
pub const REFLECTION_TIMEOUT: Duration = Duration::from_secs(45);

/// Session recovery only restores a conversation suspended less than this long ago
pub const SESSION_RECOVERY_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const SESSION_TITLE_MAX_CHARS: usize = 60;

/// Placeholder for a source whose URL could not be resolved at all
pub const SENTINEL_SOURCE_URL: &str = "about:invalid";

/// Wire protocol
pub const SSE_DATA_PREFIX: &str = "data: ";
pub const SSE_DONE_MARKER: &str = "[DONE]";
pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];
pub const SUSPENDED_AT_KEY: &str = "graceful_suspension_at";
pub const ACTIVE_SESSION_KEY: &str = "active_session_id";

/// Anonymous identity used when no user id is configured
pub const DEFAULT_USER_ID: &str = "local-user";
