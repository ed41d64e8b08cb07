/// Application name
pub const APP_NAME: &str = "Roda";

/// Number of posts fetched for the initial feed page
pub const DEFAULT_FEED_PAGE_SIZE: usize = 20;

/// Maximum message text length in bytes
pub const MAX_MESSAGE_LEN: usize = 4_096;

/// Maximum post content length in bytes
pub const MAX_POST_LEN: usize = 16_384;

/// How many times an engine tries to re-establish an invalidated
/// live subscription before giving up
pub const RESUBSCRIBE_MAX_ATTEMPTS: u32 = 5;

/// Base delay for the resubscribe backoff, doubled per attempt
pub const RESUBSCRIBE_BASE_DELAY_MS: u64 = 200;

/// Retries for the post-sign-up profile fetch (the profile row is
/// written right after the identity, so the first fetch can race it)
pub const PROFILE_FETCH_RETRIES: u32 = 3;

/// Delay between profile fetch retries
pub const PROFILE_FETCH_RETRY_DELAY_MS: u64 = 100;

/// Session token lifetime in hours
pub const SESSION_TTL_HOURS: i64 = 24;

/// Capacity of the per-engine notice broadcast channel
pub const NOTICE_CHANNEL_CAPACITY: usize = 16;
