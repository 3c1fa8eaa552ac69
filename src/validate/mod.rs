//! Answer validation: locations, pickup times, passenger counts and confirmations.

pub mod geofence;
pub mod location;
pub mod time;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::ReservationConfig;
use crate::error::{ReservationError, ValidationError};
use crate::reservation::{Answer, Place};
use crate::store::PlaceDirectory;

pub use geofence::ServiceArea;
pub use location::{Postback, is_known_place, parse_postback};
pub use time::validate_time;

/// Words accepted as a confirmation of the final summary.
pub const CONFIRM_WORDS: &[&str] = &["confirm", "yes", "last-step-confirmation"];

/// Checks answers against the service area, the place directory and the
/// configured limits.
pub struct Validator {
    area: ServiceArea,
    places: Arc<dyn PlaceDirectory>,
    known_places: Vec<String>,
    max_advance: chrono::Duration,
    max_passengers: u32,
}

impl Validator {
    pub fn new(area: ServiceArea, places: Arc<dyn PlaceDirectory>, config: &ReservationConfig) -> Self {
        Self {
            area,
            places,
            known_places: config.known_places.clone(),
            max_advance: config.max_advance,
            max_passengers: config.max_passengers,
        }
    }

    /// Resolve a location answer.
    ///
    /// Rejections come back as [`ReservationError::Invalid`]; directory
    /// failures as [`ReservationError::Database`].
    pub async fn validate_location(&self, answer: &Answer) -> Result<Place, ReservationError> {
        match answer {
            Answer::Coordinates(coords) => {
                if self.area.contains(*coords) {
                    Ok(Place::custom(*coords))
                } else {
                    Err(ValidationError::OutsideServiceArea.into())
                }
            }
            Answer::Place(id) => self.resolve(*id).await,
            Answer::Text(text) => match parse_postback(text) {
                Some(Postback::Place(id)) => self.resolve(id).await,
                Some(Postback::Malformed) => Err(ValidationError::NotALocation.into()),
                None if is_known_place(text, &self.known_places) => {
                    let typed = text.trim();
                    let found = self.places.find_place_by_name(typed).await?;
                    debug!(place = typed, found = found.is_some(), "Free-text place");
                    Ok(match found {
                        Some(location) => Place {
                            name: location.name,
                            coords: Some(location.coords),
                        },
                        None => Place {
                            name: typed.to_string(),
                            coords: None,
                        },
                    })
                }
                None => Err(ValidationError::NotALocation.into()),
            },
            Answer::DateTime(_) => Err(ValidationError::NotALocation.into()),
        }
    }

    async fn resolve(&self, id: i64) -> Result<Place, ReservationError> {
        let location = self
            .places
            .resolve_place(id)
            .await?
            .ok_or(ValidationError::UnknownPlace { id })?;
        Ok(Place {
            name: location.name,
            coords: Some(location.coords),
        })
    }

    pub fn validate_time(
        &self,
        answer: &Answer,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        validate_time(answer, now, self.max_advance)
    }

    pub fn validate_passengers(&self, answer: &Answer) -> Result<u32, ValidationError> {
        let text = answer.as_text().unwrap_or_default().trim();
        let n: i64 = text.parse().map_err(|_| ValidationError::NotANumber {
            input: text.to_string(),
        })?;
        u32::try_from(n)
            .ok()
            .filter(|n| (1..=self.max_passengers).contains(n))
            .ok_or(ValidationError::PassengerCountOutOfRange {
                min: 1,
                max: self.max_passengers,
            })
    }

    pub fn validate_confirmation(&self, answer: &Answer) -> Result<(), ValidationError> {
        let text = answer.as_text().unwrap_or_default().trim().to_lowercase();
        if CONFIRM_WORDS.contains(&text.as_str()) {
            Ok(())
        } else {
            Err(ValidationError::NotAConfirmation)
        }
    }
}
