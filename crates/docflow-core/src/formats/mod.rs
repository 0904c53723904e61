//! # Formats
//!
//! Serialization of essential-state snapshots. File I/O helpers are thin
//! wrappers; the byte format itself is a pure transformation.

pub mod snapshot;

pub use snapshot::{
    EssentialSnapshot, RestoreReport, SnapshotEntry, SnapshotHeader, load_snapshot,
    save_snapshot, snapshot_from_bytes, snapshot_to_bytes,
};
