mod availability;
mod error;
mod mutations;
mod policy;
mod queries;

pub use availability::{availability_report, check_no_conflict, conflicting_bookings, parse_day, parse_stay};
pub use error::EngineError;
pub use mutations::{ListingDraft, ListingPatch};
pub use policy::{authorize, required_capability, Action, Capability, EntityKind, Principal, Request};
pub use queries::{BookingFilter, ListingFilter, ProfileFilter};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedListingState = Arc<RwLock<ListingState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's marketplace: all state, the WAL writer, and the notify hub.
pub struct Engine {
    pub listings: DashMap<Ulid, SharedListingState>,
    pub profiles: DashMap<Ulid, ProfileState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: principal login → profile id.
    pub(super) by_principal: DashMap<String, Ulid>,
    /// Reverse lookup: booking/review id → listing id.
    pub(super) entity_to_listing: DashMap<Ulid, Ulid>,
    /// Host profile → listing ids, for O(1) host lookups.
    pub(super) host_listings: DashMap<Ulid, Vec<Ulid>>,
    /// Guest profile → booking ids, for owner-scoped booking queries.
    pub(super) guest_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Login treated as moderator even without an admin profile (bootstrap).
    pub(super) admin_user: String,
    /// Serializes profile creation so one principal never gets two profiles.
    pub(super) profile_lock: Mutex<()>,
}

/// Apply a booking/review/listing-update event to a ListingState
/// (no locking — caller holds the lock).
fn apply_to_listing(
    ls: &mut ListingState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
    guest_index: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::BookingPlaced {
            id,
            listing_id,
            guest_id,
            stay,
            status,
        } => {
            ls.insert_booking(BookingRecord {
                id: *id,
                guest_id: *guest_id,
                stay: *stay,
                status: *status,
            });
            entity_map.insert(*id, *listing_id);
            guest_index.entry(*guest_id).or_default().push(*id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = ls.booking_mut(*id) {
                b.status = *status;
            }
        }
        Event::ReviewPosted {
            id,
            listing_id,
            author_id,
            rating,
            comment,
        } => {
            ls.reviews.push(ReviewRecord {
                id: *id,
                author_id: *author_id,
                rating: *rating,
                comment: comment.clone(),
            });
            entity_map.insert(*id, *listing_id);
        }
        Event::ReviewDeleted { id, .. } => {
            ls.remove_review(*id);
            entity_map.remove(id);
        }
        Event::ListingUpdated {
            title,
            city,
            price_per_night,
            bedrooms,
            max_guests,
            status,
            ..
        } => {
            ls.title = title.clone();
            ls.city = city.clone();
            ls.price_per_night = *price_per_night;
            ls.bedrooms = *bedrooms;
            ls.max_guests = *max_guests;
            ls.status = *status;
        }
        // Profile events and listing create/delete are handled at the map level
        Event::ProfileCreated { .. }
        | Event::ProfileUpdated { .. }
        | Event::ProfileDeleted { .. }
        | Event::ListingCreated { .. }
        | Event::ListingDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        admin_user: String,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            listings: DashMap::new(),
            profiles: DashMap::new(),
            wal_tx,
            notify,
            by_principal: DashMap::new(),
            entity_to_listing: DashMap::new(),
            host_listings: DashMap::new(),
            guest_bookings: DashMap::new(),
            admin_user,
            profile_lock: Mutex::new(()),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::ProfileCreated { .. }
                | Event::ProfileUpdated { .. }
                | Event::ProfileDeleted { .. } => {
                    engine.apply_profile_event(event);
                }
                Event::ListingCreated {
                    id,
                    host_id,
                    title,
                    city,
                    price_per_night,
                    bedrooms,
                    max_guests,
                    status,
                } => {
                    let ls = ListingState::new(
                        *id,
                        *host_id,
                        title.clone(),
                        city.clone(),
                        *price_per_night,
                        *bedrooms,
                        *max_guests,
                        *status,
                    );
                    engine.listings.insert(*id, Arc::new(RwLock::new(ls)));
                    engine.host_listings.entry(*host_id).or_default().push(*id);
                }
                Event::ListingDeleted { id } => {
                    if let Some(entry) = engine.listings.get(id) {
                        let rs = entry.value().clone();
                        let guard = rs.try_read().expect("replay: uncontended read");
                        engine.purge_listing_entities(&guard);
                    }
                    engine.listings.remove(id);
                }
                other => {
                    let listing_id = event_listing_id(other);
                    if let Some(listing_id) = listing_id
                        && let Some(entry) = engine.listings.get(&listing_id)
                    {
                        let ls_arc = entry.value().clone();
                        let mut guard = ls_arc.try_write().expect("replay: uncontended write");
                        apply_to_listing(
                            &mut guard,
                            other,
                            &engine.entity_to_listing,
                            &engine.guest_bookings,
                        );
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_listing(&self, id: &Ulid) -> Option<SharedListingState> {
        self.listings.get(id).map(|e| e.value().clone())
    }

    pub fn get_listing_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_listing.get(entity_id).map(|e| *e.value())
    }

    pub fn get_profile(&self, id: &Ulid) -> Option<ProfileState> {
        self.profiles.get(id).map(|e| e.value().clone())
    }

    pub fn profile_by_principal(&self, principal: &str) -> Option<ProfileState> {
        let id = self.by_principal.get(principal).map(|e| *e.value())?;
        self.get_profile(&id)
    }

    /// Moderator capability: an admin-role profile, or the configured admin login.
    pub fn is_moderator(&self, principal: &Principal) -> bool {
        match principal.name() {
            None => false,
            Some(name) => {
                name == self.admin_user
                    || self
                        .profile_by_principal(name)
                        .is_some_and(|p| p.role == Role::Admin)
            }
        }
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        listing_id: Ulid,
        ls: &mut ListingState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_listing(ls, event, &self.entity_to_listing, &self.guest_bookings);
        self.notify.send(listing_id, event);
        Ok(())
    }

    /// Lookup booking/review → listing, get listing, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ListingState>), EngineError> {
        let listing_id = self
            .get_listing_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.write_owned().await;
        Ok((listing_id, guard))
    }

    /// Drop a deleted listing's bookings/reviews from the secondary indexes.
    pub(super) fn purge_listing_entities(&self, ls: &ListingState) {
        for b in &ls.bookings {
            self.entity_to_listing.remove(&b.id);
            if let Some(mut ids) = self.guest_bookings.get_mut(&b.guest_id) {
                ids.retain(|bid| bid != &b.id);
            }
        }
        for r in &ls.reviews {
            self.entity_to_listing.remove(&r.id);
        }
        if let Some(mut ids) = self.host_listings.get_mut(&ls.host_id) {
            ids.retain(|lid| lid != &ls.id);
        }
    }
}

/// Extract the listing_id from a booking/review/listing-update event.
fn event_listing_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingPlaced { listing_id, .. }
        | Event::BookingStatusChanged { listing_id, .. }
        | Event::ReviewPosted { listing_id, .. }
        | Event::ReviewDeleted { listing_id, .. } => Some(*listing_id),
        Event::ListingUpdated { id, .. } => Some(*id),
        Event::ProfileCreated { .. }
        | Event::ProfileUpdated { .. }
        | Event::ProfileDeleted { .. }
        | Event::ListingCreated { .. }
        | Event::ListingDeleted { .. } => None,
    }
}
