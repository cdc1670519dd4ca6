//! Persistent storage: SQLite database and the upload snapshot slot.

pub mod database;
pub mod snapshot;

pub use database::Database;
pub use snapshot::{DocumentListProvider, PersistedItem, PersistedSnapshot, SnapshotStore};
