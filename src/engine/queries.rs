use ulid::Ulid;

use crate::model::*;

use super::availability::{availability_report, parse_stay, validate_query_window};
use super::policy::{authorize, Action, EntityKind, Principal, Request};
use super::{Engine, EngineError};

/// Typed profile filter (role / verified, plus point lookups).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileFilter {
    pub id: Option<Ulid>,
    pub principal: Option<String>,
    pub role: Option<Role>,
    pub verified: Option<bool>,
}

/// Typed listing search filter. Replaces string-keyed query filtering:
/// unknown fields are rejected at parse time, not silently ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFilter {
    pub id: Option<Ulid>,
    pub host_id: Option<Ulid>,
    /// Case-insensitive substring match.
    pub city: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub min_bedrooms: Option<u32>,
    pub min_guests: Option<u32>,
}

impl ListingFilter {
    fn matches(&self, ls: &ListingState) -> bool {
        if let Some(city) = &self.city
            && !ls.city.to_lowercase().contains(&city.to_lowercase())
        {
            return false;
        }
        if self.min_price.is_some_and(|p| ls.price_per_night < p) {
            return false;
        }
        if self.max_price.is_some_and(|p| ls.price_per_night > p) {
            return false;
        }
        if self.min_bedrooms.is_some_and(|b| ls.bedrooms < b) {
            return false;
        }
        if self.min_guests.is_some_and(|g| ls.max_guests < g) {
            return false;
        }
        if self.host_id.is_some_and(|h| ls.host_id != h) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub listing_id: Option<Ulid>,
    pub guest_id: Option<Ulid>,
}

impl Engine {
    fn listing_info(&self, ls: &ListingState) -> Option<ListingInfo> {
        let host = self.get_profile(&ls.host_id)?;
        Some(ListingInfo {
            id: ls.id,
            host: ProfileInfo::from_state(&host),
            title: ls.title.clone(),
            city: ls.city.clone(),
            price_per_night: ls.price_per_night,
            bedrooms: ls.bedrooms,
            max_guests: ls.max_guests,
            status: ls.status,
            rating: ls.average_rating(),
        })
    }

    // ── Profiles ─────────────────────────────────────────

    pub fn list_profiles(
        &self,
        principal: &Principal,
        filter: &ProfileFilter,
    ) -> Result<Vec<ProfileInfo>, EngineError> {
        let action = if filter.id.is_some() || filter.principal.is_some() {
            Action::Retrieve
        } else {
            Action::List
        };
        authorize(&Request {
            principal,
            entity: EntityKind::Profile,
            action,
        })?;

        let mut out: Vec<ProfileInfo> = self
            .profiles
            .iter()
            .filter(|e| {
                let p = e.value();
                filter.id.is_none_or(|id| p.id == id)
                    && filter
                        .principal
                        .as_deref()
                        .is_none_or(|n| p.principal == n)
                    && filter.role.is_none_or(|r| p.role == r)
                    && filter.verified.is_none_or(|v| p.verified == v)
            })
            .map(|e| ProfileInfo::from_state(e.value()))
            .collect();
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    // ── Listings ─────────────────────────────────────────

    /// Bulk search: only approved listings are visible, each joined with its
    /// host profile. Open to anonymous callers.
    pub async fn search_listings(
        &self,
        principal: &Principal,
        filter: &ListingFilter,
    ) -> Result<Vec<ListingInfo>, EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Listing,
            action: Action::List,
        })?;

        let ids: Vec<Ulid> = self.listings.iter().map(|e| *e.key()).collect();
        let mut out = Vec::new();
        for id in ids {
            let Some(ls) = self.get_listing(&id) else {
                continue;
            };
            let guard = ls.read().await;
            if guard.status != ListingStatus::Approved {
                continue;
            }
            if !filter.matches(&guard) {
                continue;
            }
            if let Some(info) = self.listing_info(&guard) {
                out.push(info);
            }
        }
        out.sort_by_key(|l| l.id);
        Ok(out)
    }

    /// Retrieve by id is unscoped: unapproved listings are directly
    /// addressable even though bulk search hides them.
    pub async fn get_listing_info(
        &self,
        principal: &Principal,
        id: Ulid,
    ) -> Result<ListingInfo, EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Listing,
            action: Action::Retrieve,
        })?;
        let ls = self.get_listing(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ls.read().await;
        self.listing_info(&guard)
            .ok_or(EngineError::NotFound(guard.host_id))
    }

    /// A host's listings. Unapproved ones are visible only to that host or a
    /// moderator.
    pub async fn profile_listings(
        &self,
        principal: &Principal,
        profile_id: Ulid,
    ) -> Result<Vec<ListingInfo>, EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Listing,
            action: Action::List,
        })?;
        let full_view = self.is_moderator(principal)
            || principal
                .name()
                .and_then(|n| self.profile_by_principal(n))
                .is_some_and(|p| p.id == profile_id);

        let ids = self
            .host_listings
            .get(&profile_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for id in ids {
            let Some(ls) = self.get_listing(&id) else {
                continue;
            };
            let guard = ls.read().await;
            if !full_view && guard.status != ListingStatus::Approved {
                continue;
            }
            if let Some(info) = self.listing_info(&guard) {
                out.push(info);
            }
        }
        out.sort_by_key(|l| l.id);
        Ok(out)
    }

    // ── Bookings (owner-scoped) ──────────────────────────

    pub async fn list_bookings(
        &self,
        principal: &Principal,
        filter: &BookingFilter,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let action = if filter.id.is_some() {
            Action::Retrieve
        } else {
            Action::List
        };
        authorize(&Request {
            principal,
            entity: EntityKind::Booking,
            action,
        })?;

        let moderator = self.is_moderator(principal);
        let requester = principal.name().and_then(|n| self.profile_by_principal(n));

        if let Some(id) = filter.id {
            let listing_id = self
                .get_listing_for_entity(&id)
                .ok_or(EngineError::NotFound(id))?;
            let ls = self
                .get_listing(&listing_id)
                .ok_or(EngineError::NotFound(listing_id))?;
            let guard = ls.read().await;
            let b = guard.booking(id).ok_or(EngineError::NotFound(id))?;
            let is_party = requester
                .as_ref()
                .is_some_and(|p| p.id == b.guest_id || p.id == guard.host_id);
            if !is_party && !moderator {
                // Non-parties learn nothing, not even existence
                return Err(EngineError::NotFound(id));
            }
            return Ok(vec![BookingInfo {
                id: b.id,
                listing_id,
                guest_id: b.guest_id,
                stay: b.stay,
                status: b.status,
            }]);
        }

        if let Some(guest_id) = filter.guest_id {
            return self.profile_bookings(principal, guest_id).await;
        }

        if let Some(listing_id) = filter.listing_id {
            let ls = self
                .get_listing(&listing_id)
                .ok_or(EngineError::NotFound(listing_id))?;
            let guard = ls.read().await;
            let is_host = requester.as_ref().is_some_and(|p| p.id == guard.host_id);
            let own_only = !is_host && !moderator;
            let mut out: Vec<BookingInfo> = guard
                .bookings
                .iter()
                .filter(|b| {
                    !own_only || requester.as_ref().is_some_and(|p| p.id == b.guest_id)
                })
                .map(|b| BookingInfo {
                    id: b.id,
                    listing_id,
                    guest_id: b.guest_id,
                    stay: b.stay,
                    status: b.status,
                })
                .collect();
            out.sort_by_key(|b| b.id);
            return Ok(out);
        }

        // No filter: the caller's own bookings
        let Some(requester) = requester else {
            return Ok(Vec::new());
        };
        self.bookings_of(requester.id).await
    }

    /// A profile's bookings, visible to that profile or a moderator.
    pub async fn profile_bookings(
        &self,
        principal: &Principal,
        profile_id: Ulid,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Booking,
            action: Action::List,
        })?;
        let is_self = principal
            .name()
            .and_then(|n| self.profile_by_principal(n))
            .is_some_and(|p| p.id == profile_id);
        if !is_self && !self.is_moderator(principal) {
            return Err(EngineError::Unauthorized(
                "bookings are visible to their owner or a moderator",
            ));
        }
        self.bookings_of(profile_id).await
    }

    async fn bookings_of(&self, guest_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let booking_ids = self
            .guest_bookings
            .get(&guest_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for bid in booking_ids {
            let Some(listing_id) = self.get_listing_for_entity(&bid) else {
                continue;
            };
            let Some(ls) = self.get_listing(&listing_id) else {
                continue;
            };
            let guard = ls.read().await;
            if let Some(b) = guard.booking(bid) {
                out.push(BookingInfo {
                    id: b.id,
                    listing_id,
                    guest_id: b.guest_id,
                    stay: b.stay,
                    status: b.status,
                });
            }
        }
        out.sort_by_key(|b| b.id);
        Ok(out)
    }

    // ── Reviews ──────────────────────────────────────────

    pub async fn listing_reviews(
        &self,
        principal: &Principal,
        listing_id: Ulid,
    ) -> Result<Vec<ReviewInfo>, EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Review,
            action: Action::List,
        })?;
        let ls = match self.get_listing(&listing_id) {
            Some(ls) => ls,
            None => return Ok(vec![]),
        };
        let guard = ls.read().await;
        Ok(guard
            .reviews
            .iter()
            .map(|r| ReviewInfo {
                id: r.id,
                listing_id,
                author_id: r.author_id,
                rating: r.rating,
                comment: r.comment.clone(),
            })
            .collect())
    }

    // ── Availability ─────────────────────────────────────

    /// Read-only availability check. Dates are validated before any record
    /// access; the result is advisory (see `create_booking` for the
    /// authoritative check).
    pub async fn check_availability(
        &self,
        listing_id: Ulid,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<AvailabilityReport, EngineError> {
        let stay = parse_stay(start_date, end_date)?;
        validate_query_window(&stay)?;
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        Ok(availability_report(&guard, stay))
    }
}
