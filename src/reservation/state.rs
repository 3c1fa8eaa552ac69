//! Reservation state machine: decides which question is outstanding.
//!
//! Not a strict pipeline: every call re-scans the record, so a step whose
//! field was later found empty is asked again.
//!
//! init → to → from → when → num_passengers → final → done (→ pickup)

use super::model::{ReservationRecord, Step};

/// Check whether the record is filled, returning the first unmet step.
///
/// Order: `to`, `from`, `when`, `num_passengers`, `final`.
pub fn is_complete(record: &ReservationRecord) -> (bool, Step) {
    if record.to.is_empty() {
        return (false, Step::To);
    }
    if record.from.is_empty() {
        return (false, Step::From);
    }
    if record.reserved_at.is_none() {
        return (false, Step::When);
    }
    if record.num_passengers == 0 {
        return (false, Step::NumPassengers);
    }
    if !record.is_confirmed {
        return (false, Step::Final);
    }
    (true, Step::Done)
}

/// The step to ask next, driven by `record.state`.
pub fn whats_next(record: &ReservationRecord) -> Step {
    let (done, missing) = is_complete(record);
    if done {
        return if record.state.is_terminal() {
            Step::Pickup
        } else {
            Step::Done
        };
    }

    match record.state {
        Step::Init => Step::To,
        Step::To if record.to.is_empty() => Step::To,
        Step::From if record.from.is_empty() => Step::From,
        Step::When if record.reserved_at.is_none() => Step::When,
        // `when` may be answered first when no driver is free.
        Step::When if record.to.is_empty() => Step::To,
        Step::NumPassengers if record.num_passengers == 0 => Step::NumPassengers,
        Step::Done | Step::Pickup => Step::Pickup,
        _ => missing,
    }
}

/// Whether `target` may be asked right after `from` was answered.
pub fn can_transition_to(from: Step, target: Step) -> bool {
    use Step::*;
    match from {
        Init => matches!(target, To | Done),
        Done | Pickup => target == Pickup,
        // Any answered pipeline step may re-ask an earlier field or move on.
        _ => !matches!(target, Init),
    }
}

impl ReservationRecord {
    /// Record `answered` as the last answered step and re-derive `waiting`.
    ///
    /// A complete record settles at `done`, waiting on `pickup`.
    pub fn advance(&mut self, answered: Step) {
        self.state = answered;
        if is_complete(self).0 {
            self.state = Step::Done;
            self.waiting = Step::Pickup;
        } else {
            self.waiting = whats_next(self);
        }
    }
}
