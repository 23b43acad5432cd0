// # State Persistence
//
// Snapshot of the entry table, written by the housekeeper and at shutdown.

pub mod snapshot;

pub use snapshot::{SNAPSHOT_VERSION, SnapshotStore};
