//! Persistence backends for converted batches.
//!
//! - [`JsonDirectoryPersister`]: one JSON file per artifact in an output directory
//! - [`SqlitePersister`]: one row per artifact in a `SQLite` database

mod json;
mod sqlite;

pub use json::JsonDirectoryPersister;
pub use sqlite::{SqlitePersister, StoreError};
