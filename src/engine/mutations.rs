use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{check_no_conflict, parse_stay, validate_booking_stay};
use super::policy::{authorize, Action, EntityKind, Principal, Request};
use super::{Engine, EngineError};

/// Fields a host supplies when creating a listing. Status is never
/// client-supplied: new listings always start pending moderation.
#[derive(Debug, Clone)]
pub struct ListingDraft {
    pub title: String,
    pub city: String,
    pub price_per_night: i64,
    pub bedrooms: u32,
    pub max_guests: u32,
}

/// Partial update for a listing; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPatch {
    pub title: Option<String>,
    pub city: Option<String>,
    pub price_per_night: Option<i64>,
    pub bedrooms: Option<u32>,
    pub max_guests: Option<u32>,
    pub status: Option<ListingStatus>,
}

fn validate_listing_fields(
    title: &str,
    city: &str,
    price_per_night: i64,
    max_guests: u32,
) -> Result<(), EngineError> {
    if title.is_empty() {
        return Err(EngineError::Validation("title must not be empty"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if city.len() > MAX_CITY_LEN {
        return Err(EngineError::LimitExceeded("city too long"));
    }
    if price_per_night < 0 {
        return Err(EngineError::Validation("price_per_night must be non-negative"));
    }
    if max_guests == 0 {
        return Err(EngineError::Validation("max_guests must be at least 1"));
    }
    Ok(())
}

impl Engine {
    // ── Profiles ─────────────────────────────────────────

    pub(super) fn apply_profile_event(&self, event: &Event) {
        match event {
            Event::ProfileCreated {
                id,
                principal,
                role,
                verified,
            } => {
                self.profiles.insert(
                    *id,
                    ProfileState {
                        id: *id,
                        principal: principal.clone(),
                        role: *role,
                        verified: *verified,
                    },
                );
                self.by_principal.insert(principal.clone(), *id);
            }
            Event::ProfileUpdated { id, role, verified } => {
                if let Some(mut p) = self.profiles.get_mut(id) {
                    p.role = *role;
                    p.verified = *verified;
                }
            }
            Event::ProfileDeleted { id } => {
                if let Some((_, p)) = self.profiles.remove(id) {
                    self.by_principal.remove(&p.principal);
                }
            }
            _ => {}
        }
    }

    async fn persist_profile_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_profile_event(event);
        let id = match event {
            Event::ProfileCreated { id, .. }
            | Event::ProfileUpdated { id, .. }
            | Event::ProfileDeleted { id } => *id,
            _ => return Ok(()),
        };
        self.notify.send(id, event);
        Ok(())
    }

    /// Explicit registration. Open to anyone; elevated fields gated:
    /// role `admin` and `verified=true` require a moderator.
    pub async fn create_profile(
        &self,
        principal: &Principal,
        id: Ulid,
        owner: Option<String>,
        role: Role,
        verified: bool,
    ) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Profile,
            action: Action::Create,
        })?;
        let owner = match owner {
            Some(o) => o,
            None => principal
                .name()
                .ok_or(EngineError::Validation("principal is required"))?
                .to_string(),
        };
        if owner.is_empty() {
            return Err(EngineError::Validation("principal must not be empty"));
        }
        if owner.len() > MAX_PRINCIPAL_LEN {
            return Err(EngineError::LimitExceeded("principal name too long"));
        }
        if role == Role::Admin && !self.is_moderator(principal) {
            return Err(EngineError::Unauthorized("admin role requires a moderator"));
        }
        if verified && !self.is_moderator(principal) {
            return Err(EngineError::Unauthorized("verification requires a moderator"));
        }

        let _guard = self.profile_lock.lock().await;
        if let Some(existing) = self.profile_by_principal(&owner) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        if self.profiles.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.profiles.len() >= MAX_PROFILES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many profiles"));
        }

        let event = Event::ProfileCreated {
            id,
            principal: owner,
            role,
            verified,
        };
        self.persist_profile_event(&event).await
    }

    /// Lazy profile for a booking/review author: create with role guest if
    /// absent, never promote. Caller must be authenticated.
    pub async fn ensure_profile(&self, principal: &Principal) -> Result<ProfileState, EngineError> {
        let name = principal
            .name()
            .ok_or(EngineError::Unauthorized("authentication required"))?;
        let _guard = self.profile_lock.lock().await;
        if let Some(p) = self.profile_by_principal(name) {
            return Ok(p);
        }
        self.create_profile_locked(name, Role::Guest).await
    }

    /// The role assignment rule: get-or-create the principal's profile and
    /// promote it to host. Invoked on listing creation. Idempotent; admins
    /// are not demoted.
    pub async fn ensure_host_profile(
        &self,
        principal: &Principal,
    ) -> Result<ProfileState, EngineError> {
        let name = principal
            .name()
            .ok_or(EngineError::Unauthorized("authentication required"))?;
        let _guard = self.profile_lock.lock().await;
        match self.profile_by_principal(name) {
            Some(p) if p.role == Role::Guest => {
                let event = Event::ProfileUpdated {
                    id: p.id,
                    role: Role::Host,
                    verified: p.verified,
                };
                self.persist_profile_event(&event).await?;
                Ok(ProfileState {
                    role: Role::Host,
                    ..p
                })
            }
            Some(p) => Ok(p),
            None => self.create_profile_locked(name, Role::Host).await,
        }
    }

    /// Caller holds `profile_lock`.
    async fn create_profile_locked(
        &self,
        name: &str,
        role: Role,
    ) -> Result<ProfileState, EngineError> {
        if name.len() > MAX_PRINCIPAL_LEN {
            return Err(EngineError::LimitExceeded("principal name too long"));
        }
        if self.profiles.len() >= MAX_PROFILES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many profiles"));
        }
        let id = Ulid::new();
        let event = Event::ProfileCreated {
            id,
            principal: name.to_string(),
            role,
            verified: false,
        };
        self.persist_profile_event(&event).await?;
        Ok(ProfileState {
            id,
            principal: name.to_string(),
            role,
            verified: false,
        })
    }

    pub async fn update_profile(
        &self,
        principal: &Principal,
        id: Ulid,
        role: Option<Role>,
        verified: Option<bool>,
    ) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Profile,
            action: Action::Update,
        })?;
        let target = self.get_profile(&id).ok_or(EngineError::NotFound(id))?;
        let moderator = self.is_moderator(principal);
        let is_self = principal.name() == Some(target.principal.as_str());
        if !is_self && !moderator {
            return Err(EngineError::Unauthorized(
                "profiles may only be updated by their owner or a moderator",
            ));
        }
        let new_role = role.unwrap_or(target.role);
        if new_role == Role::Admin && target.role != Role::Admin && !moderator {
            return Err(EngineError::Unauthorized("admin role requires a moderator"));
        }
        let new_verified = verified.unwrap_or(target.verified);
        if new_verified && !target.verified && !moderator {
            return Err(EngineError::Unauthorized("verification requires a moderator"));
        }
        if new_role == target.role && new_verified == target.verified {
            return Ok(());
        }
        let event = Event::ProfileUpdated {
            id,
            role: new_role,
            verified: new_verified,
        };
        self.persist_profile_event(&event).await
    }

    pub async fn delete_profile(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Profile,
            action: Action::Delete,
        })?;
        let target = self.get_profile(&id).ok_or(EngineError::NotFound(id))?;
        let moderator = self.is_moderator(principal);
        if principal.name() != Some(target.principal.as_str()) && !moderator {
            return Err(EngineError::Unauthorized(
                "profiles may only be deleted by their owner or a moderator",
            ));
        }
        if self.host_listings.get(&id).is_some_and(|l| !l.is_empty()) {
            return Err(EngineError::HasListings(id));
        }
        let event = Event::ProfileDeleted { id };
        self.persist_profile_event(&event).await?;
        self.guest_bookings.remove(&id);
        Ok(())
    }

    // ── Listings ─────────────────────────────────────────

    pub async fn create_listing(
        &self,
        principal: &Principal,
        id: Ulid,
        draft: ListingDraft,
    ) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Listing,
            action: Action::Create,
        })?;
        validate_listing_fields(
            &draft.title,
            &draft.city,
            draft.price_per_night,
            draft.max_guests,
        )?;
        if self.listings.len() >= MAX_LISTINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many listings"));
        }
        if self.listings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let host = self.ensure_host_profile(principal).await?;

        let event = Event::ListingCreated {
            id,
            host_id: host.id,
            title: draft.title.clone(),
            city: draft.city.clone(),
            price_per_night: draft.price_per_night,
            bedrooms: draft.bedrooms,
            max_guests: draft.max_guests,
            status: ListingStatus::Pending,
        };
        self.wal_append(&event).await?;
        let ls = ListingState::new(
            id,
            host.id,
            draft.title,
            draft.city,
            draft.price_per_night,
            draft.bedrooms,
            draft.max_guests,
            ListingStatus::Pending,
        );
        self.listings
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(ls)));
        self.host_listings.entry(host.id).or_default().push(id);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_listing(
        &self,
        principal: &Principal,
        id: Ulid,
        patch: ListingPatch,
    ) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Listing,
            action: Action::Update,
        })?;
        let ls = self.get_listing(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ls.write().await;

        let moderator = self.is_moderator(principal);
        let is_owner = principal
            .name()
            .and_then(|n| self.profile_by_principal(n))
            .is_some_and(|p| p.id == guard.host_id);
        if !is_owner && !moderator {
            return Err(EngineError::Unauthorized(
                "listings may only be updated by their host or a moderator",
            ));
        }
        if patch.status.is_some_and(|s| s != guard.status) && !moderator {
            return Err(EngineError::Unauthorized(
                "listing status changes require a moderator",
            ));
        }

        let title = patch.title.unwrap_or_else(|| guard.title.clone());
        let city = patch.city.unwrap_or_else(|| guard.city.clone());
        let price_per_night = patch.price_per_night.unwrap_or(guard.price_per_night);
        let bedrooms = patch.bedrooms.unwrap_or(guard.bedrooms);
        let max_guests = patch.max_guests.unwrap_or(guard.max_guests);
        let status = patch.status.unwrap_or(guard.status);
        validate_listing_fields(&title, &city, price_per_night, max_guests)?;

        let event = Event::ListingUpdated {
            id,
            title,
            city,
            price_per_night,
            bedrooms,
            max_guests,
            status,
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn delete_listing(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Listing,
            action: Action::Delete,
        })?;
        let ls = self.get_listing(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ls.write().await;

        let moderator = self.is_moderator(principal);
        let is_owner = principal
            .name()
            .and_then(|n| self.profile_by_principal(n))
            .is_some_and(|p| p.id == guard.host_id);
        if !is_owner && !moderator {
            return Err(EngineError::Unauthorized(
                "listings may only be deleted by their host or a moderator",
            ));
        }
        if guard.has_active_bookings() {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::ListingDeleted { id };
        self.wal_append(&event).await?;
        self.purge_listing_entities(&guard);
        self.listings.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────

    /// Place a booking. Date validation happens before any record access;
    /// conflict check and insert share the listing write lock, so the
    /// availability decision commits against the state it observed.
    pub async fn create_booking(
        &self,
        principal: &Principal,
        id: Ulid,
        listing_id: Ulid,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Booking,
            action: Action::Create,
        })?;
        let stay = parse_stay(start_date, end_date)?;
        validate_booking_stay(&stay)?;
        if self.entity_to_listing.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let mut guard = ls.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many bookings on listing"));
        }

        check_no_conflict(&guard, &stay, None)?;

        // Lazy profile only after every check has passed: a rejected booking
        // leaves no writes behind. Lock order is listing → profile, everywhere.
        let guest = self.ensure_profile(principal).await?;

        let event = Event::BookingPlaced {
            id,
            listing_id,
            guest_id: guest.id,
            stay,
            status: BookingStatus::Pending,
        };
        self.persist_and_apply(listing_id, &mut guard, &event).await
    }

    /// Booking transitions: host/moderator confirm; guest/host/moderator
    /// cancel; guest re-requests a cancelled booking back to pending. Any
    /// transition out of cancelled re-runs the conflict check.
    pub async fn set_booking_status(
        &self,
        principal: &Principal,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Booking,
            action: Action::Update,
        })?;
        let (listing_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?.clone();

        let moderator = self.is_moderator(principal);
        let requester = principal.name().and_then(|n| self.profile_by_principal(n));
        let is_guest = requester.as_ref().is_some_and(|p| p.id == booking.guest_id);
        let is_host = requester.as_ref().is_some_and(|p| p.id == guard.host_id);

        if booking.status == status {
            return Ok(());
        }
        match status {
            BookingStatus::Confirmed => {
                if !is_host && !moderator {
                    return Err(EngineError::Unauthorized(
                        "only the listing host or a moderator may confirm a booking",
                    ));
                }
            }
            BookingStatus::Cancelled => {
                if !is_guest && !is_host && !moderator {
                    return Err(EngineError::Unauthorized(
                        "only the guest, the host, or a moderator may cancel a booking",
                    ));
                }
            }
            BookingStatus::Pending => {
                if booking.status != BookingStatus::Cancelled {
                    return Err(EngineError::Validation(
                        "only cancelled bookings can return to pending",
                    ));
                }
                if !is_guest && !moderator {
                    return Err(EngineError::Unauthorized(
                        "only the guest or a moderator may re-request a booking",
                    ));
                }
            }
        }

        // Coming back from cancelled re-contends for the dates
        if !booking.status.is_active() && status.is_active() {
            check_no_conflict(&guard, &booking.stay, Some(id))?;
        }

        let event = Event::BookingStatusChanged {
            id,
            listing_id,
            status,
        };
        self.persist_and_apply(listing_id, &mut guard, &event).await
    }

    /// DELETE on a booking cancels it; the record stays for history.
    pub async fn cancel_booking(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        self.set_booking_status(principal, id, BookingStatus::Cancelled)
            .await
    }

    // ── Reviews ──────────────────────────────────────────

    pub async fn post_review(
        &self,
        principal: &Principal,
        id: Ulid,
        listing_id: Ulid,
        rating: i64,
        comment: Option<String>,
    ) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Review,
            action: Action::Create,
        })?;
        if !(1..=5).contains(&rating) {
            return Err(EngineError::Validation("rating must be between 1 and 5"));
        }
        if comment.as_ref().is_some_and(|c| c.len() > MAX_COMMENT_LEN) {
            return Err(EngineError::LimitExceeded("comment too long"));
        }
        if self.entity_to_listing.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let mut guard = ls.write().await;
        if guard.reviews.len() >= MAX_REVIEWS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many reviews on listing"));
        }

        let author = self.ensure_profile(principal).await?;

        let event = Event::ReviewPosted {
            id,
            listing_id,
            author_id: author.id,
            rating: rating as u8,
            comment,
        };
        self.persist_and_apply(listing_id, &mut guard, &event).await
    }

    pub async fn delete_review(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        authorize(&Request {
            principal,
            entity: EntityKind::Review,
            action: Action::Delete,
        })?;
        let (listing_id, mut guard) = self.resolve_entity_write(&id).await?;
        let author_id = guard.review(id).ok_or(EngineError::NotFound(id))?.author_id;

        let moderator = self.is_moderator(principal);
        let is_author = principal
            .name()
            .and_then(|n| self.profile_by_principal(n))
            .is_some_and(|p| p.id == author_id);
        if !is_author && !moderator {
            return Err(EngineError::Unauthorized(
                "reviews may only be deleted by their author or a moderator",
            ));
        }

        let event = Event::ReviewDeleted { id, listing_id };
        self.persist_and_apply(listing_id, &mut guard, &event).await
    }

    // ── Maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.profiles.iter() {
            let p = entry.value();
            events.push(Event::ProfileCreated {
                id: p.id,
                principal: p.principal.clone(),
                role: p.role,
                verified: p.verified,
            });
        }

        let listing_ids: Vec<Ulid> = self.listings.iter().map(|e| *e.key()).collect();
        for id in listing_ids {
            let Some(ls) = self.get_listing(&id) else {
                continue;
            };
            let guard = ls.read().await;
            events.push(Event::ListingCreated {
                id: guard.id,
                host_id: guard.host_id,
                title: guard.title.clone(),
                city: guard.city.clone(),
                price_per_night: guard.price_per_night,
                bedrooms: guard.bedrooms,
                max_guests: guard.max_guests,
                status: guard.status,
            });
            for b in &guard.bookings {
                events.push(Event::BookingPlaced {
                    id: b.id,
                    listing_id: guard.id,
                    guest_id: b.guest_id,
                    stay: b.stay,
                    status: b.status,
                });
            }
            for r in &guard.reviews {
                events.push(Event::ReviewPosted {
                    id: r.id,
                    listing_id: guard.id,
                    author_id: r.author_id,
                    rating: r.rating,
                    comment: r.comment.clone(),
                });
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
