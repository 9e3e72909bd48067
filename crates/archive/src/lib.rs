//! Timepoint Archive - Named snapshots over the content-addressed store
//!
//! Builds the saved-backup layer on top of `timepoint-core`:
//! - Snapshot files (name + creation time + manifest) on disk
//! - Catalog enumeration of saved snapshots
//! - The snapshot / restore / delete operations the host drives

pub mod archive;
pub mod catalog;
pub mod snapshot;

// Re-export main types for convenience
pub use archive::{Archive, SnapshotReport};
pub use catalog::{Catalog, SnapshotIter};
pub use snapshot::{Snapshot, SnapshotError, SnapshotInfo};

/// Common result type used throughout timepoint-archive
pub type Result<T> = anyhow::Result<T>;
