//! Reservation record and answer data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A step of the reservation conversation.
///
/// Used both for the last answered step (`state`) and for the question being
/// asked (`waiting`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Init,
    To,
    From,
    When,
    #[serde(alias = "num_of_passengers")]
    NumPassengers,
    Final,
    Done,
    Pickup,
}

impl Step {
    /// All steps, in conversation order.
    pub const ALL: [Step; 8] = [
        Step::Init,
        Step::To,
        Step::From,
        Step::When,
        Step::NumPassengers,
        Step::Final,
        Step::Done,
        Step::Pickup,
    ];

    /// Whether the booking lifecycle has completed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Pickup)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::To => "to",
            Self::From => "from",
            Self::When => "when",
            Self::NumPassengers => "num_passengers",
            Self::Final => "final",
            Self::Done => "done",
            Self::Pickup => "pickup",
        }
    }
}

impl Default for Step {
    fn default() -> Self {
        Self::Init
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A point in `(lon, lat)` order, matching GeoJSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinates {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Interpret a `[lon, lat]` pair, where `[0, 0]` means "unset".
    pub fn from_pair(pair: [f64; 2]) -> Option<Self> {
        if pair == [0.0, 0.0] {
            None
        } else {
            Some(Self::new(pair[0], pair[1]))
        }
    }

    pub fn to_pair(self) -> [f64; 2] {
        [self.lon, self.lat]
    }
}

/// How the record came into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Started from `init` in this or an earlier session.
    #[default]
    Fresh,
    /// Rebuilt from an active durable trip after the cache entry expired.
    /// Intermediate answers were never replayed.
    Rehydrated,
}

/// The unit of conversation state for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRecord {
    pub state: Step,
    pub waiting: Step,
    pub from: String,
    pub from_coords: Option<Coordinates>,
    pub to: String,
    pub to_coords: Option<Coordinates>,
    /// Durable-store identity.
    pub user_id: Uuid,
    /// Chat-platform identity; the session key.
    pub external_user_id: String,
    pub driver_id: Option<Uuid>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub trip_id: Option<i64>,
    pub is_confirmed: bool,
    pub polyline: String,
    pub num_passengers: u32,
    pub origin: RecordOrigin,
    pub revision: u64,
}

impl ReservationRecord {
    /// A fresh record at `init`, asking for the destination.
    pub fn new(user_id: Uuid, external_user_id: impl Into<String>) -> Self {
        Self {
            state: Step::Init,
            waiting: Step::To,
            from: String::new(),
            from_coords: None,
            to: String::new(),
            to_coords: None,
            user_id,
            external_user_id: external_user_id.into(),
            driver_id: None,
            reserved_at: None,
            picked_up_at: None,
            updated_at: None,
            trip_id: None,
            is_confirmed: false,
            polyline: String::new(),
            num_passengers: 0,
            origin: RecordOrigin::Fresh,
            revision: 0,
        }
    }

    /// Whether the booking has been written to the durable store.
    pub fn is_committed(&self) -> bool {
        self.trip_id.is_some()
    }

    /// Apply a resolved place to the endpoint the given step asks for.
    pub fn set_place(&mut self, step: Step, place: Place) {
        match step {
            Step::To => {
                self.to = place.name;
                self.to_coords = place.coords;
            }
            Step::From => {
                self.from = place.name;
                self.from_coords = place.coords;
            }
            _ => {}
        }
    }
}

/// A resolved location answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub name: String,
    pub coords: Option<Coordinates>,
}

impl Place {
    /// Name used for raw coordinate answers.
    pub const CUSTOM: &'static str = "custom";

    pub fn custom(coords: Coordinates) -> Self {
        Self {
            name: Self::CUSTOM.to_string(),
            coords: Some(coords),
        }
    }
}

/// One inbound answer, already decoded from its transport shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Text(String),
    Coordinates(Coordinates),
    DateTime(DateTime<Utc>),
    /// A place picked from a list, by directory id.
    Place(i64),
}

impl Answer {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}
