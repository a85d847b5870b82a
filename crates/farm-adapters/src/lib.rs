//! Store adapters for the farm engine.
//!
//! - [`journal::JournalStore`]: append-only JSONL file, replayed on open
//! - [`fixture::FarmSeed`]: JSON seed files for demos and local runs
//!
//! The in-memory store lives in `farm_core::store::memory`.

pub mod fixture;
pub mod journal;

pub use fixture::FarmSeed;
pub use journal::{JournalRecord, JournalStore};
