//! Persistent directory size cache for dustpan.
//!
//! A single-file SQLite database maps normalized directory paths to their
//! last computed total and the modification time it was computed against.
//! Writes go through one writer connection; reads use a small pool of WAL
//! readers and never block on each other.

mod entry;
mod error;
mod store;

pub use entry::SizeEntry;
pub use error::{CacheError, Result};
pub use store::{CacheStore, DEFAULT_READERS, SCHEMA_VERSION};
