//! OSRM routing-engine client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Route, TravelRequest, TravelTimeProvider, request_error, seconds};
use crate::error::TravelError;

const PROVIDER: &str = "osrm";

/// Client for a self-hosted OSRM `route/v1` endpoint.
pub struct OsrmClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    #[serde(default)]
    geometry: Option<String>,
}

impl OsrmClient {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// `{base}/{profile}/{lon},{lat};{lon},{lat}`
    pub fn route_url(&self, request: &TravelRequest) -> String {
        format!(
            "{}/{}/{:.8},{:.8};{:.8},{:.8}",
            self.base_url,
            request.mode,
            request.from.lon,
            request.from.lat,
            request.to.lon,
            request.to.lat
        )
    }
}

/// Parse a `route/v1` response body. The first route wins.
pub fn parse_response(body: &str) -> Result<Route, TravelError> {
    let invalid = |reason: String| TravelError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason,
    };

    let resp: OsrmResponse = serde_json::from_str(body).map_err(|e| invalid(e.to_string()))?;
    if resp.code != "Ok" {
        return Err(invalid(format!(
            "code {}: {}",
            resp.code,
            resp.message.unwrap_or_default()
        )));
    }
    let route = resp
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| invalid("no routes".to_string()))?;

    Ok(Route {
        distance: route.distance,
        duration: seconds(PROVIDER, route.duration)?,
        duration_in_traffic: None,
        geometry: route.geometry.filter(|g| !g.is_empty()),
        source: PROVIDER.to_string(),
    })
}

#[async_trait]
impl TravelTimeProvider for OsrmClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn route(&self, request: &TravelRequest) -> Result<Route, TravelError> {
        let url = self.route_url(request);
        tracing::debug!(%url, "OSRM request");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, self.timeout, e))?;
        // OSRM reports errors in the body with a non-2xx status, so parse either way.
        let body = resp
            .text()
            .await
            .map_err(|e| request_error(PROVIDER, self.timeout, e))?;
        parse_response(&body)
    }
}
