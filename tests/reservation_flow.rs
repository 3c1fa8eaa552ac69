//! End-to-end reservation flows against the in-memory cache and an in-memory
//! libSQL database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;

use ride_reserve::cache::MemoryCache;
use ride_reserve::config::EngineConfig;
use ride_reserve::error::{ReservationError, ValidationError};
use ride_reserve::reservation::service::Stores;
use ride_reserve::reservation::{
    Answer, Coordinates, RecordOrigin, ReservationRecord, ReservationService, Step,
};
use ride_reserve::store::{LibSqlBackend, TripRepository, TripStatus};
use ride_reserve::validate::ServiceArea;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const PICKUP: Coordinates = Coordinates {
    lon: 100.5712,
    lat: 13.7338,
};

fn service_with(
    db: Arc<LibSqlBackend>,
    cache: Arc<MemoryCache>,
    config: &EngineConfig,
) -> ReservationService {
    ReservationService::new(
        cache,
        Stores::from_backend(db),
        ServiceArea::builtin().unwrap(),
        config,
    )
}

async fn setup() -> (Arc<ReservationService>, Arc<LibSqlBackend>) {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let service = service_with(db.clone(), Arc::new(MemoryCache::new()), &EngineConfig::default());
    (Arc::new(service), db)
}

async fn answer(service: &ReservationService, user: &str, a: Answer) -> ReservationRecord {
    let outcome = service.process_step(user, a).await.unwrap();
    assert!(outcome.rejection().is_none(), "unexpected rejection: {outcome:?}");
    outcome.into_record()
}

async fn book(service: &ReservationService, user: &str) -> ReservationRecord {
    answer(service, user, Answer::text("BTS Phromphong")).await;
    answer(service, user, Answer::Coordinates(PICKUP)).await;
    answer(service, user, Answer::text("+15min")).await;
    answer(service, user, Answer::text("2")).await;
    answer(service, user, Answer::text("confirm")).await
}

#[tokio::test]
async fn booking_walks_every_step() {
    let (service, db) = setup().await;

    let rec = answer(&service, "U1", Answer::text("BTS Phromphong")).await;
    assert_eq!((rec.state, rec.waiting), (Step::To, Step::From));
    assert!(rec.to_coords.is_some());

    let rec = answer(&service, "U1", Answer::Coordinates(PICKUP)).await;
    assert_eq!(rec.waiting, Step::When);
    assert_eq!(rec.from_coords, Some(PICKUP));

    let before = Utc::now();
    let rec = answer(&service, "U1", Answer::text("+15min")).await;
    assert_eq!(rec.waiting, Step::NumPassengers);
    let reserved = rec.reserved_at.unwrap();
    assert!(reserved >= before + chrono::Duration::minutes(15));

    let rec = answer(&service, "U1", Answer::text("2")).await;
    assert_eq!(rec.waiting, Step::Final);
    assert_eq!(rec.trip_id, None);

    let rec = answer(&service, "U1", Answer::text("confirm")).await;
    assert_eq!(rec.state, Step::Done);
    assert_eq!(rec.waiting, Step::Pickup);
    assert!(rec.is_confirmed);
    let trip_id = rec.trip_id.unwrap();
    assert!(trip_id > 0);

    let trip = db.get_trip(trip_id).await.unwrap().unwrap();
    assert_eq!(trip.status(), TripStatus::Pending);
    assert_eq!(trip.num_passengers, 2);
    assert_eq!(trip.from_coords, Some(PICKUP));
}

#[tokio::test]
async fn rejected_answers_leave_record_alone() {
    let (service, _db) = setup().await;
    answer(&service, "U1", Answer::text("BTS Phromphong")).await;
    answer(&service, "U1", Answer::Coordinates(PICKUP)).await;

    let outcome = service
        .process_step("U1", Answer::text("+25 hours"))
        .await
        .unwrap();
    assert_eq!(
        outcome.rejection(),
        Some(&ValidationError::TimeTooFarOut { max_hours: 24 })
    );
    assert_eq!(outcome.record().waiting, Step::When);
    assert!(outcome.record().reserved_at.is_none());

    answer(&service, "U1", Answer::text("now")).await;
    let outcome = service.process_step("U1", Answer::text("11")).await.unwrap();
    assert!(matches!(
        outcome.rejection(),
        Some(ValidationError::PassengerCountOutOfRange { .. })
    ));
}

#[tokio::test]
async fn lookup_is_idempotent() {
    let (service, _db) = setup().await;
    let a = service.find_or_create("U1").await.unwrap();
    let b = service.find_or_create("U1").await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a.origin, RecordOrigin::Fresh);
}

#[tokio::test]
async fn trip_is_committed_once() {
    let (service, db) = setup().await;
    let rec = book(&service, "U1").await;
    let trip_id = rec.trip_id.unwrap();

    let moved = service
        .modify_pickup_time("U1", Answer::text("+3 hours"))
        .await
        .unwrap();
    assert_eq!(moved.trip_id, Some(trip_id));

    let since = Utc::now() - chrono::Duration::hours(1);
    let trips = db.trips_changed_since(since).await.unwrap();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].id, trip_id);
    assert_eq!(
        trips[0].reserved_at.timestamp(),
        moved.reserved_at.unwrap().timestamp()
    );
}

#[tokio::test]
async fn picked_up_trip_cannot_be_cancelled() {
    let (service, db) = setup().await;
    let trip_id = book(&service, "U1").await.trip_id.unwrap();
    db.mark_picked_up(trip_id, Utc::now()).await.unwrap();

    let err = service.cancel("U1").await.unwrap_err();
    assert!(matches!(err, ReservationError::TripInProgress { trip_id: id } if id == trip_id));

    let trip = db.get_trip(trip_id).await.unwrap().unwrap();
    assert_eq!(trip.status(), TripStatus::PickedUp);
    let rec = service.find_record("U1").await.unwrap();
    assert_eq!(rec.trip_id, Some(trip_id));
}

#[tokio::test]
async fn cancel_then_rebook() {
    let (service, db) = setup().await;
    let first = book(&service, "U1").await.trip_id.unwrap();

    let c = service.cancel("U1").await.unwrap();
    assert_eq!(c.trip_id, Some(first));
    assert_eq!(c.sessions_removed, 1);
    assert_eq!(
        db.get_trip(first).await.unwrap().unwrap().status(),
        TripStatus::Cancelled
    );
    assert!(matches!(
        service.find_record("U1").await,
        Err(ReservationError::NotFound { .. })
    ));

    let second = book(&service, "U1").await.trip_id.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn concurrent_answers_are_serialised() {
    let (service, _db) = setup().await;
    let start = service.find_or_create("U1").await.unwrap();

    // Both location steps accept the same answer, so two racing answers must
    // fill `to` and then `from`.
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.process_step("U1", Answer::text("condo a")).await })
        })
        .collect();
    for h in handles {
        timeout(TEST_TIMEOUT, h).await.unwrap().unwrap().unwrap();
    }

    let rec = service.find_record("U1").await.unwrap();
    assert_eq!(rec.to, "Condo A");
    assert_eq!(rec.from, "Condo A");
    assert_eq!(rec.waiting, Step::When);
    assert_eq!(rec.revision, start.revision + 2);

    // Rejections still re-persist, and none of them is lost.
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.process_step("U1", Answer::text("soon")).await })
        })
        .collect();
    for h in handles {
        let outcome = timeout(TEST_TIMEOUT, h).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.rejection(), Some(&ValidationError::NotATime));
    }
    let rec = service.find_record("U1").await.unwrap();
    assert_eq!(rec.revision, start.revision + 10);
}

#[tokio::test]
async fn expired_session_comes_back_from_the_trip() {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mut config = EngineConfig::default();
    config.reservation.session_ttl = Duration::from_millis(100);
    let service = service_with(db.clone(), Arc::new(MemoryCache::new()), &config);

    let trip_id = book(&service, "U1").await.trip_id.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let rec = service.find_record("U1").await.unwrap();
    assert_eq!(rec.origin, RecordOrigin::Rehydrated);
    assert_eq!(rec.trip_id, Some(trip_id));
    assert_eq!((rec.state, rec.waiting), (Step::Done, Step::Pickup));
    assert_eq!(rec.to, "BTS Phromphong");
    assert_eq!(rec.num_passengers, 2);

    // A new cache (process restart) sees the same trip.
    let restarted = service_with(db, Arc::new(MemoryCache::new()), &config);
    let rec = restarted.find_or_create("U1").await.unwrap();
    assert_eq!(rec.trip_id, Some(trip_id));
}

#[tokio::test]
async fn finished_trip_starts_a_fresh_session() {
    let (service, db) = setup().await;
    let trip_id = book(&service, "U1").await.trip_id.unwrap();
    db.mark_dropped_off(trip_id, Utc::now()).await.unwrap();
    service.save_trip_feedback(trip_id, 5).await.unwrap();
    service.reset("U1").await.unwrap();

    let rec = service.find_or_create("U1").await.unwrap();
    assert_eq!(rec.state, Step::Init);
    assert_eq!(rec.origin, RecordOrigin::Fresh);
    assert_eq!(db.get_trip(trip_id).await.unwrap().unwrap().user_feedback, Some(5));
}

#[tokio::test]
async fn status_lookup_does_not_open_a_session() {
    let (service, _db) = setup().await;
    for _ in 0..2 {
        assert!(matches!(
            service.find_record("U9").await,
            Err(ReservationError::NotFound { .. })
        ));
    }
    let rec = service.find_or_create("U9").await.unwrap();
    assert_eq!(rec.origin, RecordOrigin::Fresh);
}
