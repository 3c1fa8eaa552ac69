//! Reservation sessions: the record, its state machine and the service
//! that drives it.

pub mod locks;
pub mod model;
pub mod service;
pub mod state;
pub mod wire;

pub use locks::KeyedLocks;
pub use model::{Answer, Coordinates, Place, RecordOrigin, ReservationRecord, Step};
pub use service::{Cancellation, ReservationService, StepOutcome};
pub use state::{is_complete, whats_next};
