//! Hard caps. Every limit maps to `EngineError::LimitExceeded` at the
//! boundary that first sees the oversized input.

/// Max profiles in one tenant.
pub const MAX_PROFILES_PER_TENANT: usize = 100_000;

/// Max listings in one tenant.
pub const MAX_LISTINGS_PER_TENANT: usize = 100_000;

/// Max bookings stored on one listing (active + cancelled).
pub const MAX_BOOKINGS_PER_LISTING: usize = 10_000;

/// Max reviews stored on one listing.
pub const MAX_REVIEWS_PER_LISTING: usize = 10_000;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_CITY_LEN: usize = 128;
pub const MAX_COMMENT_LEN: usize = 4_096;
pub const MAX_PRINCIPAL_LEN: usize = 128;

/// Longest bookable stay, in nights.
pub const MAX_STAY_NIGHTS: i64 = 365;

/// Widest availability query window, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 1_096;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 256;
