//! Cache wire format for [`ReservationRecord`].
//!
//! The JSON keeps the sentinel encodings older readers expect:
//! `trip_id = -1`, coordinates `[0, 0]` and the zero time
//! `0001-01-01T00:00:00Z` all mean "unset". Records carry `"v": 2`; records
//! without `v` are version 1 and use the legacy `line_user_id` and
//! `num_of_passengers` keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{Coordinates, RecordOrigin, ReservationRecord, Step};
use crate::error::CacheError;

/// Newest wire version this build writes and reads.
pub const WIRE_VERSION: u32 = 2;

const NO_TRIP: i64 = -1;

#[derive(Debug, Serialize, Deserialize)]
struct RecordWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<u32>,
    state: Step,
    waiting: Step,
    #[serde(default)]
    from: String,
    #[serde(default)]
    from_coords: [f64; 2],
    #[serde(default)]
    to: String,
    #[serde(default)]
    to_coords: [f64; 2],
    user_id: Uuid,
    #[serde(alias = "line_user_id")]
    external_user_id: String,
    #[serde(default)]
    driver_id: String,
    #[serde(default, with = "zero_time")]
    reserved_at: Option<DateTime<Utc>>,
    #[serde(default, with = "zero_time")]
    picked_up_at: Option<DateTime<Utc>>,
    #[serde(default, with = "zero_time")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default = "no_trip")]
    trip_id: i64,
    #[serde(default)]
    is_confirmed: bool,
    #[serde(default)]
    polyline: String,
    #[serde(default, alias = "num_of_passengers")]
    num_passengers: u32,
    #[serde(default)]
    origin: RecordOrigin,
    #[serde(default)]
    revision: u64,
}

fn no_trip() -> i64 {
    NO_TRIP
}

impl From<&ReservationRecord> for RecordWire {
    fn from(r: &ReservationRecord) -> Self {
        Self {
            v: Some(WIRE_VERSION),
            state: r.state,
            waiting: r.waiting,
            from: r.from.clone(),
            from_coords: r.from_coords.map(Coordinates::to_pair).unwrap_or_default(),
            to: r.to.clone(),
            to_coords: r.to_coords.map(Coordinates::to_pair).unwrap_or_default(),
            user_id: r.user_id,
            external_user_id: r.external_user_id.clone(),
            driver_id: r.driver_id.map(|id| id.to_string()).unwrap_or_default(),
            reserved_at: r.reserved_at,
            picked_up_at: r.picked_up_at,
            updated_at: r.updated_at,
            trip_id: r.trip_id.unwrap_or(NO_TRIP),
            is_confirmed: r.is_confirmed,
            polyline: r.polyline.clone(),
            num_passengers: r.num_passengers,
            origin: r.origin,
            revision: r.revision,
        }
    }
}

impl TryFrom<RecordWire> for ReservationRecord {
    type Error = CacheError;

    fn try_from(w: RecordWire) -> Result<Self, CacheError> {
        let driver_id = if w.driver_id.is_empty() {
            None
        } else {
            Some(
                Uuid::parse_str(&w.driver_id)
                    .map_err(|e| CacheError::Decode(format!("driver_id: {e}")))?,
            )
        };
        Ok(Self {
            state: w.state,
            waiting: w.waiting,
            from: w.from,
            from_coords: Coordinates::from_pair(w.from_coords),
            to: w.to,
            to_coords: Coordinates::from_pair(w.to_coords),
            user_id: w.user_id,
            external_user_id: w.external_user_id,
            driver_id,
            reserved_at: w.reserved_at,
            picked_up_at: w.picked_up_at,
            updated_at: w.updated_at,
            // Serial ids start at 1; anything lower is the unset sentinel.
            trip_id: (w.trip_id > 0).then_some(w.trip_id),
            is_confirmed: w.is_confirmed,
            polyline: w.polyline,
            num_passengers: w.num_passengers,
            origin: w.origin,
            revision: w.revision,
        })
    }
}

/// Serialize a record for the session cache.
pub fn encode(record: &ReservationRecord) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(&RecordWire::from(record)).map_err(|e| CacheError::Encode(e.to_string()))
}

/// Deserialize a cached record, accepting version 1 and the current version.
pub fn decode(bytes: &[u8]) -> Result<ReservationRecord, CacheError> {
    let wire: RecordWire =
        serde_json::from_slice(bytes).map_err(|e| CacheError::Decode(e.to_string()))?;
    let version = wire.v.unwrap_or(1);
    if version > WIRE_VERSION {
        return Err(CacheError::UnsupportedVersion {
            found: version,
            supported: WIRE_VERSION,
        });
    }
    wire.try_into()
}

/// `Option<DateTime<Utc>>` as a plain timestamp, with year 1 meaning `None`.
mod zero_time {
    use chrono::{DateTime, Datelike, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const ZERO: &str = "0001-01-01T00:00:00Z";

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_str(&t.to_rfc3339()),
            None => s.serialize_str(ZERO),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        let Some(raw) = raw.filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let t = DateTime::parse_from_rfc3339(&raw)
            .map_err(serde::de::Error::custom)?
            .with_timezone(&Utc);
        Ok((t.year() > 1).then_some(t))
    }
}
