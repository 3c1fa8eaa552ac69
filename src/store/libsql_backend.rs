//! libSQL backend for trips, users and places.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 UTC strings so they compare lexicographically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::reservation::Coordinates;
use crate::store::migrations;
use crate::store::traits::{
    Location, NewTrip, PlaceDirectory, Trip, TripRepository, TripUpdate, User, UserDirectory,
    clamp_place_count,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let applied = migrations::run_migrations(&self.conn).await?;
        if applied > 0 {
            debug!(applied, "Schema migrated");
        }
        Ok(())
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn opt_coords(lon: Option<f64>, lat: Option<f64>) -> Option<Coordinates> {
    match (lon, lat) {
        (Some(lon), Some(lat)) => Some(Coordinates::new(lon, lat)),
        _ => None,
    }
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn not_found(entity: &str, id: impl ToString) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

const TRIP_COLUMNS: &str = "id, user_id, driver_id, from_name, to_name, from_lon, from_lat, \
     to_lon, to_lat, reserved_at, accepted_at, picked_up_at, dropped_off_at, cancelled_at, \
     polyline, num_passengers, note, user_feedback, created_at, updated_at";

fn row_to_trip(row: &libsql::Row) -> Result<Trip, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("trip row parse: {e}"));

    let user_id: String = row.get(1).map_err(col)?;
    let driver_id: Option<String> = row.get(2).ok();
    let reserved_at: String = row.get(9).map_err(col)?;
    let num_passengers: i64 = row.get(15).map_err(col)?;
    let feedback: Option<i64> = row.get::<i64>(17).ok();
    let created_at: String = row.get(18).map_err(col)?;
    let updated_at: String = row.get(19).map_err(col)?;

    Ok(Trip {
        id: row.get(0).map_err(col)?,
        user_id: parse_uuid(&user_id, "trips.user_id")?,
        driver_id: driver_id
            .filter(|s| !s.is_empty())
            .map(|s| parse_uuid(&s, "trips.driver_id"))
            .transpose()?,
        from: row.get(3).map_err(col)?,
        to: row.get(4).map_err(col)?,
        from_coords: opt_coords(row.get::<f64>(5).ok(), row.get::<f64>(6).ok()),
        to_coords: opt_coords(row.get::<f64>(7).ok(), row.get::<f64>(8).ok()),
        reserved_at: parse_datetime(&reserved_at),
        accepted_at: parse_optional_datetime(row.get(10).ok()),
        picked_up_at: parse_optional_datetime(row.get(11).ok()),
        dropped_off_at: parse_optional_datetime(row.get(12).ok()),
        cancelled_at: parse_optional_datetime(row.get(13).ok()),
        polyline: row.get(14).map_err(col)?,
        num_passengers: u32::try_from(num_passengers).unwrap_or(0),
        note: row.get(16).map_err(col)?,
        user_feedback: feedback.and_then(|f| u8::try_from(f).ok()),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const USER_COLUMNS: &str = "id, external_user_id, username, language";

fn row_to_user(row: &libsql::Row) -> Result<User, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("user row parse: {e}"));
    let id: String = row.get(0).map_err(col)?;
    Ok(User {
        id: parse_uuid(&id, "users.id")?,
        external_user_id: row.get(1).map_err(col)?,
        username: row.get(2).map_err(col)?,
        language: row.get(3).map_err(col)?,
    })
}

const LOCATION_COLUMNS: &str = "id, name, name_th, name_ja, lon, lat, popularity, active";

fn row_to_location(row: &libsql::Row) -> Result<Location, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("location row parse: {e}"));
    let active: i64 = row.get(7).map_err(col)?;
    Ok(Location {
        id: row.get(0).map_err(col)?,
        name: row.get(1).map_err(col)?,
        name_th: row.get(2).ok(),
        name_ja: row.get(3).ok(),
        coords: Coordinates::new(row.get(4).map_err(col)?, row.get(5).map_err(col)?),
        popularity: row.get(6).map_err(col)?,
        active: active != 0,
    })
}

impl LibSqlBackend {
    async fn query_trips(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Trip>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut trips = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            trips.push(row_to_trip(&row)?);
        }
        Ok(trips)
    }

    /// Set one lifecycle timestamp on an active trip.
    async fn stamp_trip(
        &self,
        op: &str,
        id: i64,
        column: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "UPDATE trips SET {column} = ?1, updated_at = ?2 \
             WHERE id = ?3 AND cancelled_at IS NULL AND dropped_off_at IS NULL"
        );
        let changed = self
            .conn()
            .execute(&sql, params![ts(at), ts(Utc::now()), id])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        if changed == 0 {
            return Err(not_found("trip", id));
        }
        debug!(trip_id = id, column, "Trip stamped");
        Ok(())
    }

    async fn query_user(&self, external_user_id: &str) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE external_user_id = ?1"),
                params![external_user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_user: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_user: {e}"))),
        }
    }

    async fn query_location(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Location>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut locations = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            locations.push(row_to_location(&row)?);
        }
        Ok(locations)
    }
}

// ── TripRepository ──────────────────────────────────────────────────

#[async_trait]
impl TripRepository for LibSqlBackend {
    async fn insert_trip(&self, trip: &NewTrip) -> Result<i64, DatabaseError> {
        let now = ts(Utc::now());
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO trips (user_id, from_name, to_name, from_lon, from_lat, to_lon, to_lat,
                    reserved_at, polyline, num_passengers, note, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, '', ?11, ?11)
                 RETURNING id",
                params![
                    trip.user_id.to_string(),
                    trip.from.as_str(),
                    trip.to.as_str(),
                    opt_real(trip.from_coords.map(|c| c.lon)),
                    opt_real(trip.from_coords.map(|c| c.lat)),
                    opt_real(trip.to_coords.map(|c| c.lon)),
                    opt_real(trip.to_coords.map(|c| c.lat)),
                    ts(trip.reserved_at),
                    trip.polyline.as_str(),
                    i64::from(trip.num_passengers),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_trip: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_trip: {e}")))?
            .ok_or_else(|| DatabaseError::Query("insert_trip: no id returned".into()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("insert_trip id: {e}")))?;

        info!(trip_id = id, user_id = %trip.user_id, "Trip inserted");
        Ok(id)
    }

    async fn update_trip(&self, id: i64, update: &TripUpdate) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE trips SET from_name = ?1, to_name = ?2, from_lon = ?3, from_lat = ?4,
                    to_lon = ?5, to_lat = ?6, reserved_at = ?7, updated_at = ?8
                 WHERE id = ?9 AND picked_up_at IS NULL AND dropped_off_at IS NULL
                    AND cancelled_at IS NULL",
                params![
                    update.from.as_str(),
                    update.to.as_str(),
                    opt_real(update.from_coords.map(|c| c.lon)),
                    opt_real(update.from_coords.map(|c| c.lat)),
                    opt_real(update.to_coords.map(|c| c.lon)),
                    opt_real(update.to_coords.map(|c| c.lat)),
                    ts(update.reserved_at),
                    ts(Utc::now()),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_trip: {e}")))?;
        if changed == 0 {
            return Err(not_found("trip", id));
        }
        debug!(trip_id = id, "Trip updated");
        Ok(())
    }

    async fn get_trip(&self, id: i64) -> Result<Option<Trip>, DatabaseError> {
        let mut trips = self
            .query_trips(
                "get_trip",
                &format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(trips.pop())
    }

    async fn find_active_trip_by_user(&self, user_id: Uuid) -> Result<Option<Trip>, DatabaseError> {
        let mut trips = self
            .query_trips(
                "find_active_trip_by_user",
                &format!(
                    "SELECT {TRIP_COLUMNS} FROM trips
                     WHERE user_id = ?1 AND dropped_off_at IS NULL AND cancelled_at IS NULL
                     ORDER BY id DESC LIMIT 1"
                ),
                params![user_id.to_string()],
            )
            .await?;
        Ok(trips.pop())
    }

    async fn cancel_trip(&self, id: i64, note: &str) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE trips SET cancelled_at = ?1, note = ?2, updated_at = ?1
                 WHERE id = ?3 AND cancelled_at IS NULL AND dropped_off_at IS NULL
                    AND picked_up_at IS NULL",
                params![now, note, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_trip: {e}")))?;
        if changed == 0 {
            return Err(not_found("trip", id));
        }
        info!(trip_id = id, "Trip cancelled");
        Ok(())
    }

    async fn set_trip_polyline(&self, id: i64, polyline: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE trips SET polyline = ?1 WHERE id = ?2",
                params![polyline, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_trip_polyline: {e}")))?;
        if changed == 0 {
            return Err(not_found("trip", id));
        }
        Ok(())
    }

    async fn update_trip_note(&self, id: i64, note: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE trips
                 SET note = CASE WHEN note = '' THEN ?1 ELSE note || char(10) || ?1 END,
                     updated_at = ?2
                 WHERE id = ?3",
                params![note, ts(Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_trip_note: {e}")))?;
        if changed == 0 {
            return Err(not_found("trip", id));
        }
        Ok(())
    }

    async fn save_trip_feedback(&self, id: i64, rating: u8) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE trips SET user_feedback = ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(rating), ts(Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_trip_feedback: {e}")))?;
        if changed == 0 {
            return Err(not_found("trip", id));
        }
        Ok(())
    }

    async fn trips_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<Trip>, DatabaseError> {
        self.query_trips(
            "trips_changed_since",
            &format!(
                "SELECT {TRIP_COLUMNS} FROM trips WHERE updated_at > ?1 ORDER BY updated_at ASC, id ASC"
            ),
            params![ts(since)],
        )
        .await
    }

    async fn accept_trip(
        &self,
        id: i64,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE trips SET driver_id = ?1, accepted_at = ?2, updated_at = ?3
                 WHERE id = ?4 AND cancelled_at IS NULL AND dropped_off_at IS NULL",
                params![driver_id.to_string(), ts(at), ts(Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("accept_trip: {e}")))?;
        if changed == 0 {
            return Err(not_found("trip", id));
        }
        info!(trip_id = id, driver_id = %driver_id, "Trip accepted");
        Ok(())
    }

    async fn mark_picked_up(&self, id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.stamp_trip("mark_picked_up", id, "picked_up_at", at).await
    }

    async fn mark_dropped_off(&self, id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.stamp_trip("mark_dropped_off", id, "dropped_off_at", at).await
    }
}

// ── UserDirectory ───────────────────────────────────────────────────

#[async_trait]
impl UserDirectory for LibSqlBackend {
    async fn find_user(&self, external_user_id: &str) -> Result<Option<User>, DatabaseError> {
        self.query_user(external_user_id).await
    }

    async fn find_or_create_user(&self, external_user_id: &str) -> Result<User, DatabaseError> {
        if let Some(user) = self.query_user(external_user_id).await? {
            return Ok(user);
        }

        let now = ts(Utc::now());
        let created = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO users (id, external_user_id, username, language, created_at, updated_at)
                 VALUES (?1, ?2, ?2, 'en', ?3, ?3)",
                params![Uuid::new_v4().to_string(), external_user_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_user: {e}")))?;
        if created > 0 {
            info!(external_user_id, "User created");
        }

        self.query_user(external_user_id)
            .await?
            .ok_or_else(|| not_found("user", external_user_id))
    }

    async fn set_user_language(&self, user_id: Uuid, language: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE users SET language = ?1, updated_at = ?2 WHERE id = ?3",
                params![language, ts(Utc::now()), user_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_user_language: {e}")))?;
        if changed == 0 {
            return Err(not_found("user", user_id));
        }
        Ok(())
    }
}

// ── PlaceDirectory ──────────────────────────────────────────────────

#[async_trait]
impl PlaceDirectory for LibSqlBackend {
    async fn resolve_place(&self, id: i64) -> Result<Option<Location>, DatabaseError> {
        let mut found = self
            .query_location(
                "resolve_place",
                &format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(found.pop())
    }

    async fn find_place_by_name(&self, name: &str) -> Result<Option<Location>, DatabaseError> {
        let mut found = self
            .query_location(
                "find_place_by_name",
                &format!(
                    "SELECT {LOCATION_COLUMNS} FROM locations WHERE name = ?1 AND active = 1 LIMIT 1"
                ),
                params![name.trim()],
            )
            .await?;
        Ok(found.pop())
    }

    /// `name` of each result is localized to `lang` where a translation exists.
    async fn popular_places(&self, lang: &str, n: usize) -> Result<Vec<Location>, DatabaseError> {
        let limit = clamp_place_count(n) as i64;
        let mut places = self
            .query_location(
                "popular_places",
                &format!(
                    "SELECT {LOCATION_COLUMNS} FROM locations
                     WHERE active = 1 ORDER BY popularity DESC, id ASC LIMIT ?1"
                ),
                params![limit],
            )
            .await?;
        for place in &mut places {
            place.name = place.localized_name(lang).to_string();
        }
        Ok(places)
    }

    async fn upsert_location(&self, location: &Location) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO locations (name, name_th, name_ja, lon, lat, popularity, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                    name_th = excluded.name_th,
                    name_ja = excluded.name_ja,
                    lon = excluded.lon,
                    lat = excluded.lat,
                    popularity = excluded.popularity,
                    active = excluded.active
                 RETURNING id",
                params![
                    location.name.as_str(),
                    opt_text(location.name_th.as_deref()),
                    opt_text(location.name_ja.as_deref()),
                    location.coords.lon,
                    location.coords.lat,
                    location.popularity,
                    i64::from(location.active),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_location: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_location: {e}")))?
            .ok_or_else(|| DatabaseError::Query("upsert_location: no id returned".into()))?;
        row.get(0)
            .map_err(|e| DatabaseError::Query(format!("upsert_location id: {e}")))
    }
}
