use crate::model::Ms;

pub const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_BUFFER_MINUTES: u32 = 120;
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_PARTICIPANTS: u32 = 10_000;

/// Hard cap on instances generated for one series; unbounded rules are clamped to it.
pub const MAX_SERIES_INSTANCES: u32 = 500;
/// No series instance may start later than this after the seed.
pub const MAX_RECURRENCE_HORIZON_MS: Ms = 731 * DAY_MS;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;

pub const MAX_INTERVALS_PER_PROVIDER: usize = 100_000;
pub const MAX_PROVIDERS_PER_TENANT: usize = 10_000;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Transient WAL failures are retried this many times before surfacing `Unavailable`.
pub const WAL_APPEND_RETRIES: u32 = 3;
pub const WAL_RETRY_BACKOFF_MS: u64 = 10;
