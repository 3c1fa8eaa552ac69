//! Ride Reserve: conversational ride-reservation session engine.

pub mod cache;
pub mod config;
pub mod error;
pub mod reservation;
pub mod store;
pub mod travel;
pub mod validate;

pub use config::EngineConfig;
pub use error::{Error, ReservationError, Result};
pub use reservation::{Answer, ReservationRecord, ReservationService, Step, StepOutcome};
