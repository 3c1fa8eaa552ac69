//! Durable-store traits and row types.
//!
//! The reservation engine only talks to these traits; `LibSqlBackend`
//! implements all three.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::reservation::{Coordinates, ReservationRecord};

/// Where a trip is in its lifecycle, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Pending,
    Accepted,
    PickedUp,
    DroppedOff,
    Cancelled,
}

impl std::fmt::Display for TripStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::PickedUp => "picked_up",
            Self::DroppedOff => "dropped_off",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A committed booking.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub id: i64,
    pub user_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub from: String,
    pub to: String,
    pub from_coords: Option<Coordinates>,
    pub to_coords: Option<Coordinates>,
    pub reserved_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub dropped_off_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub polyline: String,
    pub num_passengers: u32,
    pub note: String,
    /// 1–5 star rating left after drop-off.
    pub user_feedback: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    /// Neither dropped off nor cancelled.
    pub fn is_active(&self) -> bool {
        self.dropped_off_at.is_none() && self.cancelled_at.is_none()
    }

    pub fn status(&self) -> TripStatus {
        if self.cancelled_at.is_some() {
            TripStatus::Cancelled
        } else if self.dropped_off_at.is_some() {
            TripStatus::DroppedOff
        } else if self.picked_up_at.is_some() {
            TripStatus::PickedUp
        } else if self.accepted_at.is_some() {
            TripStatus::Accepted
        } else {
            TripStatus::Pending
        }
    }
}

/// Columns written when a completed reservation is first committed.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrip {
    pub user_id: Uuid,
    pub from: String,
    pub to: String,
    pub from_coords: Option<Coordinates>,
    pub to_coords: Option<Coordinates>,
    pub reserved_at: DateTime<Utc>,
    pub polyline: String,
    pub num_passengers: u32,
}

impl NewTrip {
    /// `None` until the record has a pickup time.
    pub fn from_record(record: &ReservationRecord) -> Option<Self> {
        Some(Self {
            user_id: record.user_id,
            from: record.from.clone(),
            to: record.to.clone(),
            from_coords: record.from_coords,
            to_coords: record.to_coords,
            reserved_at: record.reserved_at?,
            polyline: record.polyline.clone(),
            num_passengers: record.num_passengers,
        })
    }
}

/// Editable columns of an already committed trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TripUpdate {
    pub from: String,
    pub to: String,
    pub from_coords: Option<Coordinates>,
    pub to_coords: Option<Coordinates>,
    pub reserved_at: DateTime<Utc>,
}

impl TripUpdate {
    pub fn from_record(record: &ReservationRecord) -> Option<Self> {
        Some(Self {
            from: record.from.clone(),
            to: record.to.clone(),
            from_coords: record.from_coords,
            to_coords: record.to_coords,
            reserved_at: record.reserved_at?,
        })
    }
}

/// A rider known to the system.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub external_user_id: String,
    pub username: String,
    /// `en`, `th` or `ja`.
    pub language: String,
}

/// A named pickup or drop-off point offered as a quick reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub name_th: Option<String>,
    pub name_ja: Option<String>,
    pub coords: Coordinates,
    pub popularity: i64,
    pub active: bool,
}

impl Location {
    /// Display name in `lang`, falling back to the default name.
    pub fn localized_name(&self, lang: &str) -> &str {
        let localized = match lang {
            "th" => self.name_th.as_deref(),
            "ja" => self.name_ja.as_deref(),
            _ => None,
        };
        localized.filter(|s| !s.is_empty()).unwrap_or(&self.name)
    }
}

/// Durable trip rows.
#[async_trait]
pub trait TripRepository: Send + Sync {
    /// Insert a trip and return its id.
    async fn insert_trip(&self, trip: &NewTrip) -> Result<i64, DatabaseError>;

    /// Overwrite the editable columns. `NotFound` when no row matches or the
    /// trip is already picked up, dropped off or cancelled.
    async fn update_trip(&self, id: i64, update: &TripUpdate) -> Result<(), DatabaseError>;

    async fn get_trip(&self, id: i64) -> Result<Option<Trip>, DatabaseError>;

    /// Most recent trip of the user that is neither dropped off nor cancelled.
    async fn find_active_trip_by_user(&self, user_id: Uuid) -> Result<Option<Trip>, DatabaseError>;

    /// Soft-cancel: stamp `cancelled_at` and set the note.
    /// `NotFound` when the trip does not exist, is no longer active or the
    /// rider is already on board.
    async fn cancel_trip(&self, id: i64, note: &str) -> Result<(), DatabaseError>;

    /// Store the encoded route geometry of the trip.
    async fn set_trip_polyline(&self, id: i64, polyline: &str) -> Result<(), DatabaseError>;

    /// Append a line to the trip note.
    async fn update_trip_note(&self, id: i64, note: &str) -> Result<(), DatabaseError>;

    /// Store a 1–5 rating.
    async fn save_trip_feedback(&self, id: i64, rating: u8) -> Result<(), DatabaseError>;

    /// Trips whose row changed strictly after `since`, oldest first.
    async fn trips_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<Trip>, DatabaseError>;

    /// Driver-side: a driver accepted the trip.
    async fn accept_trip(
        &self,
        id: i64,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Driver-side: the rider was picked up.
    async fn mark_picked_up(&self, id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Driver-side: the rider was dropped off.
    async fn mark_dropped_off(&self, id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError>;
}

/// Place vocabulary lookups.
#[async_trait]
pub trait PlaceDirectory: Send + Sync {
    async fn resolve_place(&self, id: i64) -> Result<Option<Location>, DatabaseError>;

    /// Case-insensitive lookup by default name.
    async fn find_place_by_name(&self, name: &str) -> Result<Option<Location>, DatabaseError>;

    /// Active places by popularity. `n` outside `1..=10` means 10.
    async fn popular_places(&self, lang: &str, n: usize) -> Result<Vec<Location>, DatabaseError>;

    /// Insert or update by name, returning the id.
    async fn upsert_location(&self, location: &Location) -> Result<i64, DatabaseError>;
}

/// Chat identity to durable user.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, external_user_id: &str) -> Result<Option<User>, DatabaseError>;

    async fn find_or_create_user(&self, external_user_id: &str) -> Result<User, DatabaseError>;

    async fn set_user_language(&self, user_id: Uuid, language: &str) -> Result<(), DatabaseError>;
}

/// Clamp a requested list size to `1..=10`, treating anything else as 10.
pub fn clamp_place_count(n: usize) -> usize {
    const MAX: usize = 10;
    if (1..=MAX).contains(&n) { n } else { MAX }
}
