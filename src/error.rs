//! Error types for the reservation engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Reservation error: {0}")]
    Reservation(#[from] ReservationError),

    #[error("Travel time error: {0}")]
    Travel(#[from] TravelError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid service area geometry: {0}")]
    ServiceArea(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation {operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
}

/// Session cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode session record: {0}")]
    Encode(String),

    #[error("Failed to decode session record: {0}")]
    Decode(String),

    #[error("Unsupported session record version {found} (newest known is {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// An answer that cannot be accepted for the question being asked.
///
/// The record is left untouched and the same question is asked again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Not a location")]
    NotALocation,

    #[error("Outside service area")]
    OutsideServiceArea,

    #[error("Unknown place #{id}")]
    UnknownPlace { id: i64 },

    #[error("Not a time")]
    NotATime,

    #[error("Time is in the past")]
    TimeInPast,

    #[error("Only allow {max_hours}-hr in advance")]
    TimeTooFarOut { max_hours: i64 },

    #[error("'{input}' is not a number")]
    NotANumber { input: String },

    #[error("Number of passengers must be between {min} and {max}")]
    PassengerCountOutOfRange { min: u32, max: u32 },

    #[error("Not a confirmation")]
    NotAConfirmation,

    #[error("Rating must be between {min} and {max}")]
    RatingOutOfRange { min: u8, max: u8 },
}

/// Session engine errors surfaced to the presentation layer.
#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("No record found for user {user}")]
    NotFound { user: String },

    #[error("No handler for an answer while waiting for {waiting}")]
    NoHandler { waiting: String },

    #[error("Reservation for user {user} is not completed yet")]
    NotCompleted { user: String },

    #[error("Trip #{trip_id} is already in progress, changes are not allowed at this point")]
    TripInProgress { trip_id: i64 },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl ReservationError {
    /// Whether this is a storage failure (cache or durable store).
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Cache(_))
    }
}

/// Travel-time provider errors.
#[derive(Debug, thiserror::Error)]
pub enum TravelError {
    #[error("Not enough data to get travel time")]
    MissingCoordinates,

    #[error("Provider {provider} is not configured: {reason}")]
    NotConfigured { provider: String, reason: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout {
        provider: String,
        timeout: Duration,
    },

    #[error("Request to {provider} was cancelled")]
    Cancelled { provider: String },

    #[error("All providers failed: {0}")]
    Exhausted(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
