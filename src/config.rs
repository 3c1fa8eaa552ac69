//! Configuration types.
//!
//! Built once at process start (usually via [`EngineConfig::from_env`]) and
//! handed to the constructors that need it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default vocabulary of free-text place names accepted as locations.
pub const DEFAULT_KNOWN_PLACES: &[&str] = &["condo a", "citi resort", "bts phromphong"];

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub reservation: ReservationConfig,
    pub store: StoreConfig,
    pub travel: TravelConfig,
}

/// Session and validation rules.
#[derive(Debug, Clone)]
pub struct ReservationConfig {
    /// Sliding TTL of a cached session.
    pub session_ttl: Duration,
    /// How far ahead a pickup may be requested.
    pub max_advance: chrono::Duration,
    /// Upper bound on the passenger count.
    pub max_passengers: u32,
    /// GeoJSON file with the service-area polygon. `None` uses the built-in area.
    pub service_area_path: Option<PathBuf>,
    /// Lowercase place names accepted as free-text locations.
    pub known_places: Vec<String>,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(600), // 10 minutes
            max_advance: chrono::Duration::hours(24),
            max_passengers: 10,
            service_area_path: None,
            known_places: DEFAULT_KNOWN_PLACES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Durable store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Upper bound on any single durable-store call.
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/ride-reserve.db"),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Travel-time provider settings.
#[derive(Debug, Clone)]
pub struct TravelConfig {
    /// Base URL of the self-hosted OSRM routing engine (up to `/route/v1`).
    pub osrm_base_url: String,
    /// Google Directions API key. Traffic-aware lookups are skipped without it.
    pub google_api_key: Option<SecretString>,
    /// Per-request timeout for outbound calls.
    pub timeout: Duration,
}

impl Default for TravelConfig {
    fn default() -> Self {
        Self {
            osrm_base_url: "https://router.project-osrm.org/route/v1".to_string(),
            google_api_key: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let session_ttl = parse_or(&lookup, "RIDE_SESSION_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.reservation.session_ttl);
        let max_advance = parse_or::<i64, _>(&lookup, "RIDE_MAX_ADVANCE_HOURS")?
            .map(chrono::Duration::hours)
            .unwrap_or(defaults.reservation.max_advance);
        let max_passengers =
            parse_or(&lookup, "RIDE_MAX_PASSENGERS")?.unwrap_or(defaults.reservation.max_passengers);
        if max_passengers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RIDE_MAX_PASSENGERS".into(),
                message: "must be at least 1".into(),
            });
        }

        let service_area_path = lookup("RIDE_SERVICE_AREA")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let known_places = match lookup("RIDE_KNOWN_PLACES") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.reservation.known_places,
        };

        let db_path = lookup("RIDE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.store.db_path);
        let store_timeout = parse_or(&lookup, "RIDE_STORE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.store.timeout);

        let osrm_base_url = lookup("OSRM_BASE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.travel.osrm_base_url);
        let google_api_key = lookup("GOOGLE_API_KEY")
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        let travel_timeout = parse_or(&lookup, "RIDE_TRAVEL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.travel.timeout);

        Ok(Self {
            reservation: ReservationConfig {
                session_ttl,
                max_advance,
                max_passengers,
                service_area_path,
                known_places,
            },
            store: StoreConfig {
                db_path,
                timeout: store_timeout,
            },
            travel: TravelConfig {
                osrm_base_url,
                google_api_key,
                timeout: travel_timeout,
            },
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}
