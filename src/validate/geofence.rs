//! Service-area boundary loaded from GeoJSON.
//!
//! Containment is closed: points exactly on an edge or vertex are inside,
//! including the edges of holes.

use std::path::Path;

use geo::{Coord, Intersects, LineString, MultiPolygon, Polygon};
use geojson::{GeoJson, Value};

use crate::error::ConfigError;
use crate::reservation::Coordinates;

/// Built-in area used when no boundary file is configured.
const DEFAULT_AREA: &str = include_str!("../../static/service_area.geojson");

/// One or more polygons a pickup or drop-off must fall in.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceArea {
    area: MultiPolygon<f64>,
}

impl ServiceArea {
    /// The built-in boundary shipped with the crate.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_geojson(DEFAULT_AREA)
    }

    /// Load a boundary file, or the built-in one when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_geojson(&raw)
            }
            None => Self::builtin(),
        }
    }

    /// Parse a `Polygon`/`MultiPolygon` feature, feature collection or bare geometry.
    pub fn from_geojson(raw: &str) -> Result<Self, ConfigError> {
        let doc = raw
            .parse::<GeoJson>()
            .map_err(|e| ConfigError::ServiceArea(e.to_string()))?;
        let values = match doc {
            GeoJson::Geometry(geometry) => vec![geometry.value],
            GeoJson::Feature(feature) => feature.geometry.into_iter().map(|g| g.value).collect(),
            GeoJson::FeatureCollection(collection) => collection
                .features
                .into_iter()
                .filter_map(|f| f.geometry)
                .map(|g| g.value)
                .collect(),
        };

        let mut polygons = Vec::new();
        for value in values {
            match value {
                Value::Polygon(rings) => polygons.push(polygon(rings)?),
                Value::MultiPolygon(parts) => {
                    for rings in parts {
                        polygons.push(polygon(rings)?);
                    }
                }
                _ => {
                    return Err(ConfigError::ServiceArea(
                        "expected Polygon or MultiPolygon".into(),
                    ));
                }
            }
        }
        if polygons.is_empty() {
            return Err(ConfigError::ServiceArea("no polygons".into()));
        }
        Ok(Self {
            area: MultiPolygon::new(polygons),
        })
    }

    pub fn contains(&self, point: Coordinates) -> bool {
        let coord = Coord {
            x: point.lon,
            y: point.lat,
        };
        self.area.0.iter().any(|p| p.intersects(&coord))
    }
}

fn polygon(rings: Vec<Vec<Vec<f64>>>) -> Result<Polygon<f64>, ConfigError> {
    let mut rings = rings.into_iter().map(ring);
    let exterior = rings
        .next()
        .ok_or_else(|| ConfigError::ServiceArea("polygon without rings".into()))??;
    let holes = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, holes))
}

fn ring(positions: Vec<Vec<f64>>) -> Result<LineString<f64>, ConfigError> {
    let coords = positions
        .into_iter()
        .map(|p| match p.as_slice() {
            [lon, lat, ..] => Ok(Coord { x: *lon, y: *lat }),
            _ => Err(ConfigError::ServiceArea(format!("bad position {p:?}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if coords.len() < 3 {
        return Err(ConfigError::ServiceArea(format!(
            "ring needs at least 3 positions, got {}",
            coords.len()
        )));
    }
    Ok(LineString::new(coords))
}
