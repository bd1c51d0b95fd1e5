//! SQLite persistence: one snapshot header plus its position and order
//! rows per matched message, committed as a single transaction.

pub mod persister;
pub mod schema;
pub mod types;

pub use persister::{is_terminal, spawn_persister, InsertReport, PersistHandle, Persister, RetryPolicy};
pub use types::{OrderRecord, ParsedSnapshot, PositionRecord, SnapshotRecord};
