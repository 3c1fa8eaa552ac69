//! Fast TTL store for in-progress reservation sessions.

pub mod memory;
pub mod traits;

pub use memory::{MemoryCache, spawn_sweep_task};
pub use traits::SessionCache;
