//! Google Directions client (traffic-aware).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{Route, TravelRequest, TravelTimeProvider, request_error, seconds};
use crate::error::TravelError;

const PROVIDER: &str = "google";
const DIRECTIONS_URL: &str = "https://maps.googleapis.com/maps/api/directions/json";

pub struct GoogleDirectionsClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Deserialize)]
struct DirectionsRoute {
    #[serde(default)]
    legs: Vec<Leg>,
    #[serde(default)]
    overview_polyline: Option<Polyline>,
}

#[derive(Deserialize)]
struct Polyline {
    points: String,
}

#[derive(Deserialize)]
struct Leg {
    distance: TextValue,
    duration: TextValue,
    #[serde(default)]
    duration_in_traffic: Option<TextValue>,
}

#[derive(Deserialize)]
struct TextValue {
    value: f64,
}

impl GoogleDirectionsClient {
    pub fn new(client: reqwest::Client, api_key: SecretString, timeout: Duration) -> Self {
        Self::with_base_url(client, api_key, DIRECTIONS_URL, timeout)
    }

    pub fn with_base_url(
        client: reqwest::Client,
        api_key: SecretString,
        base_url: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.to_string(),
            timeout,
        }
    }

    /// Query parameters without the key. Origin and destination are `lat,lon`.
    fn query(request: &TravelRequest) -> Vec<(&'static str, String)> {
        // The API rejects departures in the past.
        let departure = request
            .departure
            .map(|t| t.max(Utc::now()))
            .unwrap_or_else(Utc::now);
        vec![
            ("departure_time", departure.timestamp().to_string()),
            ("traffic_model", "pessimistic".to_string()),
            (
                "origin",
                format!("{:.8},{:.8}", request.from.lat, request.from.lon),
            ),
            (
                "destination",
                format!("{:.8},{:.8}", request.to.lat, request.to.lon),
            ),
        ]
    }
}

/// Parse a Directions response. Only `status == "OK"` is accepted.
pub fn parse_response(body: &str) -> Result<Route, TravelError> {
    let invalid = |reason: String| TravelError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason,
    };

    let resp: DirectionsResponse =
        serde_json::from_str(body).map_err(|e| invalid(e.to_string()))?;
    if resp.status != "OK" {
        return Err(invalid(match resp.error_message {
            Some(msg) => format!("status {}: {msg}", resp.status),
            None => format!("status {}", resp.status),
        }));
    }

    let route = resp
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| invalid("no routes".to_string()))?;
    let geometry = route.overview_polyline.map(|p| p.points);
    let leg = route
        .legs
        .into_iter()
        .next()
        .ok_or_else(|| invalid("route without legs".to_string()))?;

    Ok(Route {
        distance: leg.distance.value,
        duration: seconds(PROVIDER, leg.duration.value)?,
        duration_in_traffic: leg
            .duration_in_traffic
            .map(|d| seconds(PROVIDER, d.value))
            .transpose()?,
        geometry,
        source: PROVIDER.to_string(),
    })
}

#[async_trait]
impl TravelTimeProvider for GoogleDirectionsClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn route(&self, request: &TravelRequest) -> Result<Route, TravelError> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&Self::query(request))
            .query(&[("key", self.api_key.expose_secret())])
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, self.timeout, e))?;

        if !resp.status().is_success() {
            return Err(TravelError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {}", resp.status()),
            });
        }
        let body = resp
            .text()
            .await
            .map_err(|e| request_error(PROVIDER, self.timeout, e))?;
        parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::reservation::Coordinates;
    use crate::travel::TravelMode;

    fn request(departure: Option<chrono::DateTime<Utc>>) -> TravelRequest {
        TravelRequest {
            from: Coordinates::new(100.5685933, 13.7319484),
            to: Coordinates::new(100.5695537, 13.7430816),
            departure,
            mode: TravelMode::Car,
        }
    }

    #[test]
    fn parses_traffic_duration() {
        let body = r#"{
            "geocoded_waypoints": [],
            "routes": [{
                "summary": "Sukhumvit Rd",
                "overview_polyline": {"points": "e~tpAkcadR"},
                "legs": [{
                    "distance": {"text": "1.5 km", "value": 1502},
                    "duration": {"text": "5 mins", "value": 312},
                    "duration_in_traffic": {"text": "9 mins", "value": 541},
                    "start_address": "A",
                    "end_address": "B"
                }]
            }],
            "status": "OK"
        }"#;
        let route = parse_response(body).unwrap();
        assert_eq!(route.distance, 1502.0);
        assert_eq!(route.duration, Duration::from_secs(312));
        assert_eq!(route.duration_in_traffic, Some(Duration::from_secs(541)));
        assert_eq!(route.expected_duration(), Duration::from_secs(541));
        assert_eq!(route.geometry.as_deref(), Some("e~tpAkcadR"));
        assert_eq!(route.source, "google");
    }

    #[test]
    fn non_ok_status_is_an_error() {
        let body = r#"{"routes": [], "status": "REQUEST_DENIED", "error_message": "bad key"}"#;
        let err = parse_response(body).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("REQUEST_DENIED"));
        assert!(msg.contains("bad key"));
    }

    #[test]
    fn empty_routes_are_invalid() {
        let body = r#"{"routes": [], "status": "OK"}"#;
        assert!(matches!(parse_response(body), Err(TravelError::InvalidResponse { .. })));
    }

    #[test]
    fn query_uses_lat_lon_order_and_future_departure() {
        let later = Utc::now() + ChronoDuration::hours(2);
        let q = GoogleDirectionsClient::query(&request(Some(later)));
        assert!(q.contains(&("departure_time", later.timestamp().to_string())));
        assert!(q.contains(&("traffic_model", "pessimistic".to_string())));
        assert!(q.contains(&("origin", "13.73194840,100.56859330".to_string())));
        assert!(q.contains(&("destination", "13.74308160,100.56955370".to_string())));

        let past = Utc::now() - ChronoDuration::hours(2);
        let q = GoogleDirectionsClient::query(&request(Some(past)));
        let (_, departure) = &q[0];
        assert!(departure.parse::<i64>().unwrap() >= Utc::now().timestamp() - 5);
    }
}
