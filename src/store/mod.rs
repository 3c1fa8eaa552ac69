//! Durable storage: trips, users and the place vocabulary.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Location, NewTrip, PlaceDirectory, Trip, TripRepository, TripStatus, TripUpdate, User,
    UserDirectory,
};
