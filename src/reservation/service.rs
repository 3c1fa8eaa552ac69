//! Reservation session orchestration.
//!
//! Cache-aside over two tiers: the session cache holds the in-progress
//! record, the durable store holds committed trips. Durable writes happen
//! before the cache write, and every mutation of one user's record runs under
//! that user's lock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cache::SessionCache;
use crate::config::EngineConfig;
use crate::error::{DatabaseError, ReservationError, ValidationError};
use crate::reservation::locks::KeyedLocks;
use crate::reservation::model::{Answer, RecordOrigin, ReservationRecord, Step};
use crate::reservation::wire;
use crate::store::{
    Location, NewTrip, PlaceDirectory, Trip, TripRepository, TripUpdate, UserDirectory,
};
use crate::travel::Route;
use crate::validate::{ServiceArea, Validator};

/// Note stored on trips cancelled from the chat.
pub const CANCEL_NOTE: &str = "User cancelled via chat";

/// Result of feeding one answer to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The answer was applied.
    Accepted(ReservationRecord),
    /// The answer was refused; `record` is unchanged apart from its revision.
    Rejected {
        record: ReservationRecord,
        reason: ValidationError,
    },
}

impl StepOutcome {
    pub fn record(&self) -> &ReservationRecord {
        match self {
            Self::Accepted(record) | Self::Rejected { record, .. } => record,
        }
    }

    pub fn into_record(self) -> ReservationRecord {
        match self {
            Self::Accepted(record) | Self::Rejected { record, .. } => record,
        }
    }

    pub fn rejection(&self) -> Option<&ValidationError> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected { reason, .. } => Some(reason),
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    /// The trip that was cancelled, if the session had been committed.
    pub trip_id: Option<i64>,
    /// Cache entries removed.
    pub sessions_removed: u64,
}

/// Durable collaborators of the service.
#[derive(Clone)]
pub struct Stores {
    pub trips: Arc<dyn TripRepository>,
    pub users: Arc<dyn UserDirectory>,
    pub places: Arc<dyn PlaceDirectory>,
}

impl Stores {
    /// All three roles served by one backend.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: TripRepository + UserDirectory + PlaceDirectory + 'static,
    {
        Self {
            trips: backend.clone(),
            users: backend.clone(),
            places: backend,
        }
    }
}

/// Drives reservation sessions: lookup, step processing, cancellation and
/// pickup-time changes.
pub struct ReservationService {
    cache: Arc<dyn SessionCache>,
    stores: Stores,
    validator: Validator,
    locks: KeyedLocks,
    session_ttl: Duration,
    store_timeout: Duration,
}

impl ReservationService {
    pub fn new(
        cache: Arc<dyn SessionCache>,
        stores: Stores,
        area: ServiceArea,
        config: &EngineConfig,
    ) -> Self {
        let validator = Validator::new(area, stores.places.clone(), &config.reservation);
        Self {
            cache,
            stores,
            validator,
            locks: KeyedLocks::new(),
            session_ttl: config.reservation.session_ttl,
            store_timeout: config.store.timeout,
        }
    }

    // ── Session lookup ──────────────────────────────────────────────

    /// The user's session, rehydrated from an active trip or created fresh
    /// when the cache has none.
    pub async fn find_or_create(&self, user_key: &str) -> Result<ReservationRecord, ReservationError> {
        let _guard = self.locks.lock(user_key).await;
        self.find_or_create_locked(user_key).await
    }

    /// The user's session without creating one. `NotFound` when neither the
    /// cache nor an active trip has it.
    pub async fn find_record(&self, user_key: &str) -> Result<ReservationRecord, ReservationError> {
        let _guard = self.locks.lock(user_key).await;
        self.find_locked(user_key).await?.ok_or_else(|| ReservationError::NotFound {
            user: user_key.to_string(),
        })
    }

    async fn find_or_create_locked(
        &self,
        user_key: &str,
    ) -> Result<ReservationRecord, ReservationError> {
        if let Some(record) = self.load(user_key).await? {
            return Ok(record);
        }

        let user = self
            .durable("find_or_create_user", self.stores.users.find_or_create_user(user_key))
            .await?;
        let active = self
            .durable(
                "find_active_trip_by_user",
                self.stores.trips.find_active_trip_by_user(user.id),
            )
            .await?;

        let mut record = match active {
            Some(trip) => rehydrate(&trip, user_key),
            None => {
                info!(user = %user_key, "New reservation session");
                ReservationRecord::new(user.id, user_key)
            }
        };
        self.save(&mut record).await?;
        Ok(record)
    }

    async fn find_locked(
        &self,
        user_key: &str,
    ) -> Result<Option<ReservationRecord>, ReservationError> {
        if let Some(record) = self.load(user_key).await? {
            return Ok(Some(record));
        }

        let Some(user) = self
            .durable("find_user", self.stores.users.find_user(user_key))
            .await?
        else {
            return Ok(None);
        };
        let Some(trip) = self
            .durable(
                "find_active_trip_by_user",
                self.stores.trips.find_active_trip_by_user(user.id),
            )
            .await?
        else {
            return Ok(None);
        };

        let mut record = rehydrate(&trip, user_key);
        self.save(&mut record).await?;
        Ok(Some(record))
    }

    // ── Step processing ─────────────────────────────────────────────

    /// Apply one answer to the question the session is waiting on.
    ///
    /// A refused answer comes back as [`StepOutcome::Rejected`] with the
    /// record unchanged; storage failures leave the cached record unchanged
    /// and are returned as errors.
    pub async fn process_step(
        &self,
        user_key: &str,
        answer: Answer,
    ) -> Result<StepOutcome, ReservationError> {
        let _guard = self.locks.lock(user_key).await;
        let unchanged = self.find_or_create_locked(user_key).await?;
        let answered = unchanged.waiting;
        debug!(user = %user_key, step = %answered, "Processing answer");

        let result = match answered {
            Step::Pickup | Step::Done => self.pickup_answer(unchanged.clone(), &answer).await,
            _ => self.apply_answer(unchanged.clone(), answered, &answer).await,
        };

        match result {
            // The trip row already reflects this record; never fall back to `unchanged`.
            Ok(record) if record.state == Step::Done => {
                self.persist_committed(record).await.map(StepOutcome::Accepted)
            }
            Ok(mut record) => match self.save(&mut record).await {
                Ok(()) => Ok(StepOutcome::Accepted(record)),
                Err(e) => {
                    self.repersist(unchanged).await;
                    Err(e)
                }
            },
            Err(ReservationError::Invalid(reason)) => {
                debug!(user = %user_key, step = %answered, %reason, "Answer rejected");
                let record = self.repersist(unchanged).await;
                Ok(StepOutcome::Rejected { record, reason })
            }
            Err(e) => {
                self.repersist(unchanged).await;
                Err(e)
            }
        }
    }

    async fn apply_answer(
        &self,
        mut record: ReservationRecord,
        answered: Step,
        answer: &Answer,
    ) -> Result<ReservationRecord, ReservationError> {
        match answered {
            Step::To | Step::From => {
                let place = self.validator.validate_location(answer).await?;
                record.set_place(answered, place);
            }
            Step::When => {
                record.reserved_at = Some(self.validator.validate_time(answer, Utc::now())?);
            }
            Step::NumPassengers => {
                record.num_passengers = self.validator.validate_passengers(answer)?;
            }
            Step::Final => {
                self.validator.validate_confirmation(answer)?;
                record.is_confirmed = true;
            }
            Step::Init | Step::Done | Step::Pickup => {
                return Err(ReservationError::NoHandler {
                    waiting: answered.to_string(),
                });
            }
        }

        record.advance(answered);
        record.updated_at = Some(Utc::now());

        if record.state == Step::Done {
            self.commit(&mut record).await?;
        }
        Ok(record)
    }

    /// After completion the only accepted answer is a new pickup time.
    async fn pickup_answer(
        &self,
        record: ReservationRecord,
        answer: &Answer,
    ) -> Result<ReservationRecord, ReservationError> {
        let is_time = match answer {
            Answer::DateTime(_) => true,
            Answer::Text(_) => !matches!(
                self.validator.validate_time(answer, Utc::now()),
                Err(ValidationError::NotATime)
            ),
            _ => false,
        };
        if !is_time {
            return Err(ReservationError::NoHandler {
                waiting: record.waiting.to_string(),
            });
        }
        self.modify_locked(record, answer).await
    }

    // ── Post-completion changes ─────────────────────────────────────

    /// Move the pickup time of a completed, not yet picked-up reservation.
    pub async fn modify_pickup_time(
        &self,
        user_key: &str,
        answer: Answer,
    ) -> Result<ReservationRecord, ReservationError> {
        let _guard = self.locks.lock(user_key).await;
        let record = self
            .find_locked(user_key)
            .await?
            .ok_or_else(|| ReservationError::NotFound {
                user: user_key.to_string(),
            })?;
        let record = self.modify_locked(record, &answer).await?;
        self.persist_committed(record).await
    }

    /// Validate the new time and write it to the trip. The caller persists
    /// the session.
    async fn modify_locked(
        &self,
        mut record: ReservationRecord,
        answer: &Answer,
    ) -> Result<ReservationRecord, ReservationError> {
        if record.state != Step::Done {
            return Err(ReservationError::NotCompleted {
                user: record.external_user_id.clone(),
            });
        }
        if let Some(trip_id) = self.picked_up_trip(&record).await? {
            return Err(ReservationError::TripInProgress { trip_id });
        }

        record.reserved_at = Some(self.validator.validate_time(answer, Utc::now())?);
        record.updated_at = Some(Utc::now());
        self.commit(&mut record).await?;
        info!(
            user = %record.external_user_id,
            trip_id = ?record.trip_id,
            reserved_at = ?record.reserved_at,
            "Pickup time changed"
        );
        Ok(record)
    }

    /// Cancel the user's session and, if committed, soft-cancel the trip.
    ///
    /// Refused once the rider has been picked up. With no session at all this
    /// reports zero cancellations.
    pub async fn cancel(&self, user_key: &str) -> Result<Cancellation, ReservationError> {
        let _guard = self.locks.lock(user_key).await;
        let Some(record) = self.find_locked(user_key).await? else {
            return Ok(Cancellation {
                trip_id: None,
                sessions_removed: 0,
            });
        };

        if let Some(trip_id) = record.trip_id {
            if self.picked_up_trip(&record).await?.is_some() {
                return Err(ReservationError::TripInProgress { trip_id });
            }
            match self
                .durable("cancel_trip", self.stores.trips.cancel_trip(trip_id, CANCEL_NOTE))
                .await
            {
                Ok(()) => {}
                Err(DatabaseError::NotFound { .. }) => {
                    // Picked up after the check above, or already finished.
                    if self.trip_picked_up(trip_id).await? {
                        return Err(ReservationError::TripInProgress { trip_id });
                    }
                    debug!(trip_id, "Trip no longer active");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let sessions_removed = self.cache.delete(user_key).await?;
        info!(user = %user_key, trip_id = ?record.trip_id, sessions_removed, "Reservation cancelled");
        Ok(Cancellation {
            trip_id: record.trip_id,
            sessions_removed,
        })
    }

    /// Drop the cached session only.
    pub async fn reset(&self, user_key: &str) -> Result<u64, ReservationError> {
        let _guard = self.locks.lock(user_key).await;
        Ok(self.cache.delete(user_key).await?)
    }

    /// Keep the route geometry on the session and, once committed, on the trip.
    pub async fn attach_route(
        &self,
        user_key: &str,
        route: &Route,
    ) -> Result<ReservationRecord, ReservationError> {
        let _guard = self.locks.lock(user_key).await;
        let mut record = self
            .find_locked(user_key)
            .await?
            .ok_or_else(|| ReservationError::NotFound {
                user: user_key.to_string(),
            })?;
        let Some(geometry) = route.geometry.as_deref().filter(|g| !g.is_empty()) else {
            return Ok(record);
        };
        if record.polyline == geometry {
            return Ok(record);
        }

        record.polyline = geometry.to_string();
        if let Some(trip_id) = record.trip_id {
            self.durable(
                "set_trip_polyline",
                self.stores.trips.set_trip_polyline(trip_id, geometry),
            )
            .await?;
        }
        self.save(&mut record).await?;
        debug!(user = %user_key, trip_id = ?record.trip_id, source = %route.source, "Route attached");
        Ok(record)
    }

    // ── Trip follow-ups ─────────────────────────────────────────────

    /// Append the rider's reason to a cancelled trip's note.
    pub async fn record_cancellation_reason(
        &self,
        trip_id: i64,
        reason: &str,
    ) -> Result<(), ReservationError> {
        let note = format!("Cancellation reason: {}", reason.trim());
        self.durable("update_trip_note", self.stores.trips.update_trip_note(trip_id, &note))
            .await?;
        Ok(())
    }

    /// Store a 1–5 rating for a trip.
    pub async fn save_trip_feedback(&self, trip_id: i64, rating: u8) -> Result<(), ReservationError> {
        if !(1..=5).contains(&rating) {
            return Err(ValidationError::RatingOutOfRange { min: 1, max: 5 }.into());
        }
        self.durable(
            "save_trip_feedback",
            self.stores.trips.save_trip_feedback(trip_id, rating),
        )
        .await?;
        Ok(())
    }

    /// Trips whose status changed after `since`, for notification fan-out.
    pub async fn trips_changed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trip>, ReservationError> {
        Ok(self
            .durable("trips_changed_since", self.stores.trips.trips_changed_since(since))
            .await?)
    }

    /// Quick-reply places in the user's language, skipping endpoints the
    /// session already chose.
    pub async fn popular_places(
        &self,
        user_key: &str,
        n: usize,
    ) -> Result<Vec<Location>, ReservationError> {
        let language = self
            .durable("find_user", self.stores.users.find_user(user_key))
            .await?
            .map(|u| u.language)
            .unwrap_or_else(|| "en".to_string());
        let record = self.load(user_key).await?;

        let places = self
            .durable("popular_places", self.stores.places.popular_places(&language, n))
            .await?;
        Ok(places
            .into_iter()
            .filter(|place| match &record {
                Some(r) => {
                    Some(place.coords) != r.from_coords
                        && Some(place.coords) != r.to_coords
                        && !place.name.eq_ignore_ascii_case(&r.from)
                        && !place.name.eq_ignore_ascii_case(&r.to)
                }
                None => true,
            })
            .collect())
    }

    // ── Storage helpers ─────────────────────────────────────────────

    /// Insert the trip on first completion, update it afterwards.
    ///
    /// A user has at most one active trip: an uncommitted session whose user
    /// already has one (its earlier session write was lost) takes that trip
    /// over instead of inserting another.
    async fn commit(&self, record: &mut ReservationRecord) -> Result<(), ReservationError> {
        if let Some(id) = record.trip_id {
            return self.update_trip_from(record, id).await;
        }

        let active = self
            .durable(
                "find_active_trip_by_user",
                self.stores.trips.find_active_trip_by_user(record.user_id),
            )
            .await?;
        if let Some(trip) = active {
            warn!(
                user = %record.external_user_id,
                trip_id = trip.id,
                "Session lost its trip id, adopting active trip"
            );
            record.trip_id = Some(trip.id);
            return self.update_trip_from(record, trip.id).await;
        }

        let trip = NewTrip::from_record(record).ok_or_else(|| ReservationError::NotCompleted {
            user: record.external_user_id.clone(),
        })?;
        let id = self
            .durable("insert_trip", self.stores.trips.insert_trip(&trip))
            .await?;
        record.trip_id = Some(id);
        info!(user = %record.external_user_id, trip_id = id, "Reservation committed");
        Ok(())
    }

    async fn update_trip_from(
        &self,
        record: &ReservationRecord,
        id: i64,
    ) -> Result<(), ReservationError> {
        let update = TripUpdate::from_record(record).ok_or_else(|| {
            ReservationError::NotCompleted {
                user: record.external_user_id.clone(),
            }
        })?;
        match self
            .durable("update_trip", self.stores.trips.update_trip(id, &update))
            .await
        {
            Ok(()) => {
                debug!(trip_id = id, "Trip updated from session");
                Ok(())
            }
            Err(e @ DatabaseError::NotFound { .. }) => {
                if self.trip_picked_up(id).await? {
                    Err(ReservationError::TripInProgress { trip_id: id })
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn trip_picked_up(&self, trip_id: i64) -> Result<bool, ReservationError> {
        let trip = self
            .durable("get_trip", self.stores.trips.get_trip(trip_id))
            .await?;
        Ok(trip.is_some_and(|t| t.picked_up_at.is_some()))
    }

    /// The trip id when the rider is already on board, per the session or
    /// the durable row.
    async fn picked_up_trip(
        &self,
        record: &ReservationRecord,
    ) -> Result<Option<i64>, ReservationError> {
        let Some(trip_id) = record.trip_id else {
            return Ok(None);
        };
        if record.picked_up_at.is_some() || self.trip_picked_up(trip_id).await? {
            return Ok(Some(trip_id));
        }
        Ok(None)
    }

    async fn load(&self, user_key: &str) -> Result<Option<ReservationRecord>, ReservationError> {
        let Some(bytes) = self.cache.get(user_key).await? else {
            debug!(user = %user_key, "Session cache miss");
            return Ok(None);
        };
        Ok(Some(wire::decode(&bytes)?))
    }

    async fn save(&self, record: &mut ReservationRecord) -> Result<(), ReservationError> {
        record.revision += 1;
        let bytes = wire::encode(record)?;
        self.cache
            .set(&record.external_user_id, bytes, self.session_ttl)
            .await?;
        debug!(
            user = %record.external_user_id,
            revision = record.revision,
            waiting = %record.waiting,
            "Session saved"
        );
        Ok(())
    }

    /// Save a record whose trip row is already written. A failed cache write
    /// is retried once so the trip id is not dropped from the session.
    async fn persist_committed(
        &self,
        mut record: ReservationRecord,
    ) -> Result<ReservationRecord, ReservationError> {
        match self.save(&mut record).await {
            Ok(()) => Ok(record),
            Err(e) => {
                warn!(
                    user = %record.external_user_id,
                    trip_id = ?record.trip_id,
                    error = %e,
                    "Session write failed after commit"
                );
                self.repersist(record).await;
                Err(e)
            }
        }
    }

    /// Write back the record so its TTL slides. Failures are only logged.
    async fn repersist(&self, mut record: ReservationRecord) -> ReservationRecord {
        if let Err(e) = self.save(&mut record).await {
            warn!(user = %record.external_user_id, error = %e, "Failed to re-persist session");
        }
        record
    }

    async fn durable<T, F>(&self, operation: &str, fut: F) -> Result<T, DatabaseError>
    where
        F: Future<Output = Result<T, DatabaseError>>,
    {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| DatabaseError::Timeout {
                operation: operation.to_string(),
                timeout: self.store_timeout,
            })?
    }
}

/// Rebuild a completed session from its durable trip.
fn rehydrate(trip: &Trip, user_key: &str) -> ReservationRecord {
    let mut record = ReservationRecord::new(trip.user_id, user_key);
    record.state = Step::Done;
    record.waiting = Step::Pickup;
    record.from = trip.from.clone();
    record.from_coords = trip.from_coords;
    record.to = trip.to.clone();
    record.to_coords = trip.to_coords;
    record.driver_id = trip.driver_id;
    record.reserved_at = Some(trip.reserved_at);
    record.picked_up_at = trip.picked_up_at;
    record.updated_at = Some(trip.updated_at);
    record.trip_id = Some(trip.id);
    record.is_confirmed = true;
    record.polyline = trip.polyline.clone();
    record.num_passengers = trip.num_passengers;
    record.origin = RecordOrigin::Rehydrated;
    info!(user = %user_key, trip_id = trip.id, "Session rehydrated from active trip");
    record
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::CacheError;
    use crate::reservation::Coordinates;
    use crate::store::LibSqlBackend;

    /// A cache whose writes can be switched off, or refused just once.
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCache,
        fail_writes: AtomicBool,
        fail_next_write: AtomicBool,
    }

    #[async_trait]
    impl SessionCache for FlakyCache {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
            if self.fail_writes.load(Ordering::SeqCst)
                || self.fail_next_write.swap(false, Ordering::SeqCst)
            {
                return Err(CacheError::Unavailable("write refused".into()));
            }
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<u64, CacheError> {
            self.inner.delete(key).await
        }
    }

    struct Harness {
        service: ReservationService,
        cache: Arc<FlakyCache>,
        db: Arc<LibSqlBackend>,
    }

    async fn harness() -> Harness {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cache = Arc::new(FlakyCache::default());
        let service = ReservationService::new(
            cache.clone(),
            Stores::from_backend(db.clone()),
            ServiceArea::builtin().unwrap(),
            &EngineConfig::default(),
        );
        Harness { service, cache, db }
    }

    const INSIDE: Coordinates = Coordinates {
        lon: 100.5712,
        lat: 13.7338,
    };

    async fn until_final(h: &Harness, user: &str) {
        let s = &h.service;
        s.process_step(user, Answer::text("BTS Phromphong")).await.unwrap();
        s.process_step(user, Answer::Coordinates(INSIDE)).await.unwrap();
        s.process_step(user, Answer::text("+15min")).await.unwrap();
        s.process_step(user, Answer::text("2")).await.unwrap();
    }

    async fn complete(h: &Harness, user: &str) -> ReservationRecord {
        until_final(h, user).await;
        h.service
            .process_step(user, Answer::text("confirm"))
            .await
            .unwrap()
            .into_record()
    }

    async fn trip_count(h: &Harness) -> usize {
        h.db
            .trips_changed_since(Utc::now() - ChronoDuration::hours(1))
            .await
            .unwrap()
            .len()
    }

    fn route(geometry: Option<&str>) -> Route {
        Route {
            distance: 1502.0,
            duration: Duration::from_secs(312),
            duration_in_traffic: None,
            geometry: geometry.map(str::to_string),
            source: "osrm".into(),
        }
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let h = harness().await;
        let first = h.service.find_or_create("U1").await.unwrap();
        let second = h.service.find_or_create("U1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.state, Step::Init);
        assert_eq!(first.waiting, Step::To);
        assert_eq!(first.trip_id, None);
    }

    #[tokio::test]
    async fn find_record_does_not_create() {
        let h = harness().await;
        assert!(matches!(
            h.service.find_record("ghost").await,
            Err(ReservationError::NotFound { .. })
        ));
        assert!(h.cache.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_flow_commits() {
        let h = harness().await;
        let rec = complete(&h, "U1").await;
        assert_eq!(rec.state, Step::Done);
        assert_eq!(rec.waiting, Step::Pickup);
        assert!(rec.is_confirmed);
        let trip_id = rec.trip_id.unwrap();

        let trip = h.db.get_trip(trip_id).await.unwrap().unwrap();
        assert_eq!(trip.to, "BTS Phromphong");
        assert_eq!(trip.from, "custom");
        assert_eq!(trip.num_passengers, 2);
    }

    #[tokio::test]
    async fn rejection_keeps_record() {
        let h = harness().await;
        let before = h.service.find_or_create("U1").await.unwrap();
        let outcome = h
            .service
            .process_step("U1", Answer::Coordinates(Coordinates::new(100.4, 13.9)))
            .await
            .unwrap();

        assert_eq!(outcome.rejection(), Some(&ValidationError::OutsideServiceArea));
        let after = outcome.into_record();
        assert_eq!(after.waiting, Step::To);
        assert!(after.to.is_empty());
        assert_eq!(after.revision, before.revision + 1);
    }

    #[tokio::test]
    async fn unconfirmed_final_is_rejected() {
        let h = harness().await;
        let s = &h.service;
        s.process_step("U1", Answer::text("BTS Phromphong")).await.unwrap();
        s.process_step("U1", Answer::Coordinates(INSIDE)).await.unwrap();
        s.process_step("U1", Answer::text("now")).await.unwrap();
        s.process_step("U1", Answer::text("1")).await.unwrap();

        let outcome = s.process_step("U1", Answer::text("hmm")).await.unwrap();
        assert_eq!(outcome.rejection(), Some(&ValidationError::NotAConfirmation));
        assert_eq!(outcome.record().waiting, Step::Final);
        assert_eq!(outcome.record().trip_id, None);
    }

    #[tokio::test]
    async fn cache_failure_is_a_storage_error() {
        let h = harness().await;
        h.service.find_or_create("U1").await.unwrap();
        h.cache.fail_writes.store(true, Ordering::SeqCst);

        let err = h
            .service
            .process_step("U1", Answer::text("BTS Phromphong"))
            .await
            .unwrap_err();
        assert!(err.is_storage());

        h.cache.fail_writes.store(false, Ordering::SeqCst);
        let rec = h.service.find_or_create("U1").await.unwrap();
        assert!(rec.to.is_empty());
        assert_eq!(rec.waiting, Step::To);
    }

    #[tokio::test]
    async fn lost_session_write_after_commit_does_not_duplicate_trip() {
        let h = harness().await;
        until_final(&h, "U1").await;

        h.cache.fail_writes.store(true, Ordering::SeqCst);
        let err = h
            .service
            .process_step("U1", Answer::text("confirm"))
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert_eq!(trip_count(&h).await, 1);

        // The session still waits on the confirmation; confirming again must
        // reuse the trip written above.
        h.cache.fail_writes.store(false, Ordering::SeqCst);
        let stale = h.service.find_or_create("U1").await.unwrap();
        assert_eq!(stale.trip_id, None);
        let rec = h
            .service
            .process_step("U1", Answer::text("confirm"))
            .await
            .unwrap()
            .into_record();

        assert_eq!(rec.state, Step::Done);
        assert_eq!(trip_count(&h).await, 1);
        let active = h.db.find_active_trip_by_user(rec.user_id).await.unwrap().unwrap();
        assert_eq!(rec.trip_id, Some(active.id));
    }

    #[tokio::test]
    async fn committed_record_is_retried_after_write_failure() {
        let h = harness().await;
        until_final(&h, "U1").await;

        h.cache.fail_next_write.store(true, Ordering::SeqCst);
        assert!(h
            .service
            .process_step("U1", Answer::text("confirm"))
            .await
            .is_err());

        let rec = h.service.find_record("U1").await.unwrap();
        assert_eq!(rec.state, Step::Done);
        assert!(rec.trip_id.is_some());
        assert_eq!(trip_count(&h).await, 1);
    }

    #[tokio::test]
    async fn route_is_kept_on_session_and_trip() {
        let h = harness().await;
        until_final(&h, "U1").await;

        // Before commit the geometry rides along with the insert.
        let rec = h.service.attach_route("U1", &route(Some("abc~xyz"))).await.unwrap();
        assert_eq!(rec.polyline, "abc~xyz");
        let rec = h
            .service
            .process_step("U1", Answer::text("confirm"))
            .await
            .unwrap()
            .into_record();
        let trip_id = rec.trip_id.unwrap();
        assert_eq!(h.db.get_trip(trip_id).await.unwrap().unwrap().polyline, "abc~xyz");

        // After commit the trip row is updated too.
        let rec = h.service.attach_route("U1", &route(Some("e~tpAkcadR"))).await.unwrap();
        assert_eq!(rec.polyline, "e~tpAkcadR");
        assert_eq!(h.db.get_trip(trip_id).await.unwrap().unwrap().polyline, "e~tpAkcadR");

        // No geometry leaves things as they were.
        let rec = h.service.attach_route("U1", &route(None)).await.unwrap();
        assert_eq!(rec.polyline, "e~tpAkcadR");
        assert!(matches!(
            h.service.attach_route("ghost", &route(Some("x"))).await,
            Err(ReservationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn pickup_time_change_updates_same_trip() {
        let h = harness().await;
        let rec = complete(&h, "U1").await;
        let trip_id = rec.trip_id.unwrap();

        let outcome = h
            .service
            .process_step("U1", Answer::text("+2 hours"))
            .await
            .unwrap();
        let changed = outcome.into_record();
        assert_eq!(changed.trip_id, Some(trip_id));
        assert!(changed.reserved_at > rec.reserved_at);

        let trip = h.db.get_trip(trip_id).await.unwrap().unwrap();
        assert_eq!(
            trip.reserved_at.timestamp(),
            changed.reserved_at.unwrap().timestamp()
        );
        assert_eq!(trip_count(&h).await, 1);
    }

    #[tokio::test]
    async fn pickup_waiting_without_time_has_no_handler() {
        let h = harness().await;
        complete(&h, "U1").await;
        let err = h
            .service
            .process_step("U1", Answer::text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::NoHandler { .. }));
    }

    #[tokio::test]
    async fn modify_requires_completion() {
        let h = harness().await;
        h.service.find_or_create("U1").await.unwrap();
        assert!(matches!(
            h.service.modify_pickup_time("U1", Answer::text("+1 hour")).await,
            Err(ReservationError::NotCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn modify_refused_after_pickup() {
        let h = harness().await;
        let rec = complete(&h, "U1").await;
        let trip_id = rec.trip_id.unwrap();
        h.db.mark_picked_up(trip_id, Utc::now()).await.unwrap();

        assert!(matches!(
            h.service.modify_pickup_time("U1", Answer::text("+1 hour")).await,
            Err(ReservationError::TripInProgress { trip_id: id }) if id == trip_id
        ));
    }

    #[tokio::test]
    async fn modify_rejects_bad_time() {
        let h = harness().await;
        complete(&h, "U1").await;
        let past = Answer::DateTime(Utc::now() - ChronoDuration::minutes(5));
        assert!(matches!(
            h.service.modify_pickup_time("U1", past.clone()).await,
            Err(ReservationError::Invalid(ValidationError::TimeInPast))
        ));
        let outcome = h.service.process_step("U1", past).await.unwrap();
        assert_eq!(outcome.rejection(), Some(&ValidationError::TimeInPast));
    }

    #[tokio::test]
    async fn cancel_without_session() {
        let h = harness().await;
        let c = h.service.cancel("nobody").await.unwrap();
        assert_eq!(c, Cancellation { trip_id: None, sessions_removed: 0 });
    }

    #[tokio::test]
    async fn cancel_in_progress_session_clears_cache() {
        let h = harness().await;
        h.service.process_step("U1", Answer::text("condo a")).await.unwrap();
        let c = h.service.cancel("U1").await.unwrap();
        assert_eq!(c, Cancellation { trip_id: None, sessions_removed: 1 });
        assert!(h.cache.get("U1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_committed_trip() {
        let h = harness().await;
        let trip_id = complete(&h, "U1").await.trip_id.unwrap();

        let c = h.service.cancel("U1").await.unwrap();
        assert_eq!(c.trip_id, Some(trip_id));
        let trip = h.db.get_trip(trip_id).await.unwrap().unwrap();
        assert!(trip.cancelled_at.is_some());
        assert_eq!(trip.note, CANCEL_NOTE);

        h.service.record_cancellation_reason(trip_id, "changed plans").await.unwrap();
        let trip = h.db.get_trip(trip_id).await.unwrap().unwrap();
        assert!(trip.note.ends_with("Cancellation reason: changed plans"));

        // Next contact starts over.
        let fresh = h.service.find_or_create("U1").await.unwrap();
        assert_eq!(fresh.state, Step::Init);
    }

    #[tokio::test]
    async fn cancel_refused_after_pickup() {
        let h = harness().await;
        let trip_id = complete(&h, "U1").await.trip_id.unwrap();
        h.db.mark_picked_up(trip_id, Utc::now()).await.unwrap();

        assert!(matches!(
            h.service.cancel("U1").await,
            Err(ReservationError::TripInProgress { .. })
        ));
        let trip = h.db.get_trip(trip_id).await.unwrap().unwrap();
        assert!(trip.cancelled_at.is_none());
        assert!(h.cache.get("U1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_session_rehydrates_from_trip() {
        let h = harness().await;
        let trip_id = complete(&h, "U1").await.trip_id.unwrap();
        h.service.reset("U1").await.unwrap();

        let rec = h.service.find_or_create("U1").await.unwrap();
        assert_eq!(rec.origin, RecordOrigin::Rehydrated);
        assert_eq!(rec.trip_id, Some(trip_id));
        assert_eq!(rec.state, Step::Done);
        assert_eq!(rec.waiting, Step::Pickup);
        assert!(rec.is_confirmed);
    }

    #[tokio::test]
    async fn feedback_bounds() {
        let h = harness().await;
        let trip_id = complete(&h, "U1").await.trip_id.unwrap();
        assert!(matches!(
            h.service.save_trip_feedback(trip_id, 6).await,
            Err(ReservationError::Invalid(ValidationError::RatingOutOfRange { .. }))
        ));
        h.service.save_trip_feedback(trip_id, 4).await.unwrap();
        assert_eq!(h.db.get_trip(trip_id).await.unwrap().unwrap().user_feedback, Some(4));
    }

    #[tokio::test]
    async fn popular_places_skip_chosen_endpoint() {
        let h = harness().await;
        let all = h.service.popular_places("U1", 4).await.unwrap();
        assert_eq!(all.len(), 3);

        h.service.process_step("U1", Answer::text("BTS Phromphong")).await.unwrap();
        let rest = h.service.popular_places("U1", 4).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|p| p.name != "BTS Phromphong"));
    }

    #[tokio::test]
    async fn unsupported_cache_version_surfaces() {
        let h = harness().await;
        let mut json: serde_json::Value =
            serde_json::from_slice(&wire::encode(&ReservationRecord::new(uuid::Uuid::new_v4(), "U1")).unwrap())
                .unwrap();
        json["v"] = serde_json::json!(99);
        h.cache
            .set("U1", json.to_string().into_bytes(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            h.service.find_or_create("U1").await,
            Err(ReservationError::Cache(CacheError::UnsupportedVersion { found: 99, .. }))
        ));
    }
}
