use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar date — the only time type on the wire (`YYYY-MM-DD`).
pub type Day = NaiveDate;

/// Half-open stay `[start_date, end_date)`.
///
/// Endpoint equality is not overlap: checkout morning equals checkin morning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stay {
    pub start: Day,
    pub end: Day,
}

impl Stay {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start < end, "Stay start must be before end");
        Self { start, end }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_day(&self, d: Day) -> bool {
        self.start <= d && d < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Guest,
    Host,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Host => "host",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "guest" => Some(Role::Guest),
            "host" => Some(Role::Host),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Pending,
    Approved,
    Rejected,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Pending => "pending",
            ListingStatus::Approved => "approved",
            ListingStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<ListingStatus> {
        match s {
            "pending" => Some(ListingStatus::Pending),
            "approved" => Some(ListingStatus::Approved),
            "rejected" => Some(ListingStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings block availability; cancelled ones never do.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<BookingStatus> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

/// A principal's application-level identity record.
#[derive(Debug, Clone)]
pub struct ProfileState {
    pub id: Ulid,
    pub principal: String,
    pub role: Role,
    pub verified: bool,
}

/// A reservation of a listing for a stay, held by a guest profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub id: Ulid,
    pub guest_id: Ulid,
    pub stay: Stay,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRecord {
    pub id: Ulid,
    pub author_id: Ulid,
    pub rating: u8,
    pub comment: Option<String>,
}

/// A bookable property record. Bookings and reviews live inside the listing;
/// the per-listing lock covers every read-then-decide on them.
#[derive(Debug, Clone)]
pub struct ListingState {
    pub id: Ulid,
    pub host_id: Ulid,
    pub title: String,
    pub city: String,
    /// Nightly price in minor currency units.
    pub price_per_night: i64,
    pub bedrooms: u32,
    pub max_guests: u32,
    pub status: ListingStatus,
    /// All bookings (any status), sorted by `stay.start`.
    pub bookings: Vec<BookingRecord>,
    pub reviews: Vec<ReviewRecord>,
}

impl ListingState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Ulid,
        host_id: Ulid,
        title: String,
        city: String,
        price_per_night: i64,
        bedrooms: u32,
        max_guests: u32,
        status: ListingStatus,
    ) -> Self {
        Self {
            id,
            host_id,
            title,
            city,
            price_per_night,
            bedrooms,
            max_guests,
            status,
            bookings: Vec::new(),
            reviews: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by stay.start.
    pub fn insert_booking(&mut self, booking: BookingRecord) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.stay.start, |b| b.stay.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<BookingRecord> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&BookingRecord> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut BookingRecord> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose stay overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &BookingRecord> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.bookings.partition_point(|b| b.stay.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.end > query.start)
    }

    pub fn review(&self, id: Ulid) -> Option<&ReviewRecord> {
        self.reviews.iter().find(|r| r.id == id)
    }

    pub fn remove_review(&mut self, id: Ulid) -> Option<ReviewRecord> {
        if let Some(pos) = self.reviews.iter().position(|r| r.id == id) {
            Some(self.reviews.remove(pos))
        } else {
            None
        }
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(|b| b.status.is_active())
    }

    pub fn average_rating(&self) -> Option<f64> {
        if self.reviews.is_empty() {
            return None;
        }
        let sum: u32 = self.reviews.iter().map(|r| u32::from(r.rating)).sum();
        Some(f64::from(sum) / self.reviews.len() as f64)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfileCreated {
        id: Ulid,
        principal: String,
        role: Role,
        verified: bool,
    },
    ProfileUpdated {
        id: Ulid,
        role: Role,
        verified: bool,
    },
    ProfileDeleted {
        id: Ulid,
    },
    ListingCreated {
        id: Ulid,
        host_id: Ulid,
        title: String,
        city: String,
        price_per_night: i64,
        bedrooms: u32,
        max_guests: u32,
        status: ListingStatus,
    },
    ListingUpdated {
        id: Ulid,
        title: String,
        city: String,
        price_per_night: i64,
        bedrooms: u32,
        max_guests: u32,
        status: ListingStatus,
    },
    ListingDeleted {
        id: Ulid,
    },
    BookingPlaced {
        id: Ulid,
        listing_id: Ulid,
        guest_id: Ulid,
        stay: Stay,
        status: BookingStatus,
    },
    BookingStatusChanged {
        id: Ulid,
        listing_id: Ulid,
        status: BookingStatus,
    },
    ReviewPosted {
        id: Ulid,
        listing_id: Ulid,
        author_id: Ulid,
        rating: u8,
        comment: Option<String>,
    },
    ReviewDeleted {
        id: Ulid,
        listing_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileInfo {
    pub id: Ulid,
    pub principal: String,
    pub role: Role,
    pub verified: bool,
}

impl ProfileInfo {
    pub fn from_state(p: &ProfileState) -> Self {
        Self {
            id: p.id,
            principal: p.principal.clone(),
            role: p.role,
            verified: p.verified,
        }
    }
}

/// Listing joined with its owning host profile for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingInfo {
    pub id: Ulid,
    pub host: ProfileInfo,
    pub title: String,
    pub city: String,
    pub price_per_night: i64,
    pub bedrooms: u32,
    pub max_guests: u32,
    pub status: ListingStatus,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub guest_id: Ulid,
    pub stay: Stay,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewInfo {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub author_id: Ulid,
    pub rating: u8,
    pub comment: Option<String>,
}

/// Result of an availability check — advisory; the authoritative rejection
/// happens under the listing write lock at booking time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub listing_id: Ulid,
    pub stay: Stay,
    pub available: bool,
    pub conflicting: usize,
}
