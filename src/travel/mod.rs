//! Travel-time estimates for a reservation.
//!
//! Two providers: a traffic-aware directions API used when the pickup time is
//! known, and a self-hosted OSRM routing engine as the fallback. Estimates
//! enrich replies only; nothing in the reservation flow waits on them.

pub mod google;
pub mod osrm;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TravelConfig;
use crate::error::TravelError;
use crate::reservation::{Coordinates, ReservationRecord};

pub use google::GoogleDirectionsClient;
pub use osrm::OsrmClient;

/// Routing profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    Walk,
    Car,
}

impl TravelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Walk => "walk",
            Self::Car => "car",
        }
    }
}

impl std::fmt::Display for TravelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One origin/destination query.
#[derive(Debug, Clone, PartialEq)]
pub struct TravelRequest {
    pub from: Coordinates,
    pub to: Coordinates,
    pub departure: Option<DateTime<Utc>>,
    pub mode: TravelMode,
}

impl TravelRequest {
    /// Both endpoints need coordinates.
    pub fn from_record(record: &ReservationRecord, mode: TravelMode) -> Result<Self, TravelError> {
        match (record.from_coords, record.to_coords) {
            (Some(from), Some(to)) => Ok(Self {
                from,
                to,
                departure: record.reserved_at,
                mode,
            }),
            _ => Err(TravelError::MissingCoordinates),
        }
    }
}

/// A provider's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Metres.
    pub distance: f64,
    pub duration: Duration,
    pub duration_in_traffic: Option<Duration>,
    /// Encoded polyline, when the provider returns one.
    pub geometry: Option<String>,
    pub source: String,
}

impl Route {
    /// Traffic-aware duration when known, otherwise the free-flow one.
    pub fn expected_duration(&self) -> Duration {
        self.duration_in_traffic.unwrap_or(self.duration)
    }
}

/// A travel-time source.
#[async_trait]
pub trait TravelTimeProvider: Send + Sync {
    /// Provider name for logs and `Route::source`.
    fn name(&self) -> &str;

    async fn route(&self, request: &TravelRequest) -> Result<Route, TravelError>;
}

/// Seconds from a provider response as a `Duration`.
fn seconds(provider: &str, value: f64) -> Result<Duration, TravelError> {
    Duration::try_from_secs_f64(value).map_err(|e| TravelError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("duration {value}: {e}"),
    })
}

/// Map a transport error onto `TravelError`.
fn request_error(provider: &str, timeout: Duration, e: reqwest::Error) -> TravelError {
    if e.is_timeout() {
        TravelError::Timeout {
            provider: provider.to_string(),
            timeout,
        }
    } else {
        TravelError::RequestFailed {
            provider: provider.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Shared HTTP client for the providers.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, TravelError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TravelError::NotConfigured {
            provider: "http".to_string(),
            reason: e.to_string(),
        })
}

/// Traffic-aware lookup with routing-engine fallback.
pub struct TravelTimeService {
    traffic: Option<Arc<dyn TravelTimeProvider>>,
    routing: Arc<dyn TravelTimeProvider>,
}

impl TravelTimeService {
    pub fn new(
        traffic: Option<Arc<dyn TravelTimeProvider>>,
        routing: Arc<dyn TravelTimeProvider>,
    ) -> Self {
        Self { traffic, routing }
    }

    /// OSRM always; Google Directions only when an API key is configured.
    pub fn from_config(config: &TravelConfig) -> Result<Self, TravelError> {
        let client = http_client(config.timeout)?;
        let routing: Arc<dyn TravelTimeProvider> = Arc::new(OsrmClient::new(
            client.clone(),
            &config.osrm_base_url,
            config.timeout,
        ));
        let traffic = config.google_api_key.clone().map(|key| {
            Arc::new(GoogleDirectionsClient::new(client, key, config.timeout))
                as Arc<dyn TravelTimeProvider>
        });
        Ok(Self::new(traffic, routing))
    }

    /// Estimate the drive for a record.
    ///
    /// With a pickup time the traffic-aware provider goes first; any failure
    /// there falls back to the routing engine.
    pub async fn estimate(
        &self,
        record: &ReservationRecord,
        cancel: &CancellationToken,
    ) -> Result<Route, TravelError> {
        let request = TravelRequest::from_record(record, TravelMode::Car)?;
        let mut failures = Vec::new();

        if let (Some(traffic), Some(_)) = (&self.traffic, request.departure) {
            match Self::ask(traffic.as_ref(), &request, cancel).await {
                Ok(route) => return Ok(route),
                Err(e @ TravelError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    warn!(provider = traffic.name(), error = %e, "Traffic-aware lookup failed, falling back");
                    failures.push(e.to_string());
                }
            }
        }

        match Self::ask(self.routing.as_ref(), &request, cancel).await {
            Ok(route) => Ok(route),
            Err(e @ TravelError::Cancelled { .. }) => Err(e),
            Err(e) => {
                failures.push(e.to_string());
                Err(TravelError::Exhausted(failures.join("; ")))
            }
        }
    }

    /// Route for an explicit mode on the routing engine only.
    pub async fn route_with_mode(
        &self,
        record: &ReservationRecord,
        mode: TravelMode,
        cancel: &CancellationToken,
    ) -> Result<Route, TravelError> {
        let request = TravelRequest::from_record(record, mode)?;
        Self::ask(self.routing.as_ref(), &request, cancel).await
    }

    async fn ask(
        provider: &dyn TravelTimeProvider,
        request: &TravelRequest,
        cancel: &CancellationToken,
    ) -> Result<Route, TravelError> {
        debug!(provider = provider.name(), mode = %request.mode, "Requesting travel time");
        tokio::select! {
            biased;

            () = cancel.cancelled() => Err(TravelError::Cancelled {
                provider: provider.name().to_string(),
            }),
            result = provider.route(request) => result,
        }
    }
}
