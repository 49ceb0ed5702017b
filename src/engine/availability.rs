use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

// ── Availability / conflict kernel ───────────────────────────────

/// Parse a `YYYY-MM-DD` wire date.
pub fn parse_day(s: &str) -> Result<Day, EngineError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| EngineError::Validation("invalid date format, use YYYY-MM-DD"))
}

/// Validate a stay from raw wire input. Runs before any record access —
/// missing or malformed dates never touch the store.
pub fn parse_stay(start: Option<&str>, end: Option<&str>) -> Result<Stay, EngineError> {
    let (Some(start), Some(end)) = (start, end) else {
        return Err(EngineError::Validation(
            "start_date and end_date are required",
        ));
    };
    let start = parse_day(start)?;
    let end = parse_day(end)?;
    if end <= start {
        return Err(EngineError::Validation("end_date must be after start_date"));
    }
    Ok(Stay::new(start, end))
}

pub(super) fn validate_booking_stay(stay: &Stay) -> Result<(), EngineError> {
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(super) fn validate_query_window(stay: &Stay) -> Result<(), EngineError> {
    if stay.nights() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Active bookings whose stay overlaps `stay`. Cancelled bookings never block.
pub fn conflicting_bookings<'a>(
    listing: &'a ListingState,
    stay: &'a Stay,
) -> impl Iterator<Item = &'a BookingRecord> + 'a {
    listing.overlapping(stay).filter(|b| b.status.is_active())
}

/// First-conflict check on the booking write path. The caller holds the
/// listing write lock, so check and insert form one critical section.
pub fn check_no_conflict(
    listing: &ListingState,
    stay: &Stay,
    exclude: Option<ulid::Ulid>,
) -> Result<(), EngineError> {
    if let Some(existing) = conflicting_bookings(listing, stay).find(|b| Some(b.id) != exclude) {
        return Err(EngineError::Conflict(existing.id));
    }
    Ok(())
}

/// Read-only availability report for the wire surface. Advisory only — the
/// authoritative rejection is `check_no_conflict` under the write lock.
pub fn availability_report(listing: &ListingState, stay: Stay) -> AvailabilityReport {
    let conflicting = conflicting_bookings(listing, &stay).count();
    AvailabilityReport {
        listing_id: listing.id,
        stay,
        available: conflicting == 0,
        conflicting,
    }
}
