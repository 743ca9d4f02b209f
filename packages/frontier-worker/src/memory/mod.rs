//! In-process implementations of the worker's external collaborators.
//!
//! Used by the `memory://` bus location and by tests.

mod backend;
mod bus;

pub use backend::{MemoryBackend, LINK_SCORE, SEED_SCORE};
pub use bus::{MemoryBus, MemoryConsumer};
