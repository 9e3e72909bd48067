//! Timepoint Core - Content-addressed storage engine for directory snapshots
//!
//! This crate provides the storage layer:
//! - Content digests (BLAKE3 or SHA-256, chosen per store)
//! - Snapshot manifests and their binary encoding
//! - Directory scanning with optional parallel hashing
//! - The deduplicating blob store with reference-counted deletion

pub mod codec;
pub mod id;
pub mod manifest;
pub mod scan;
pub mod store;

// Re-export main types for convenience
pub use codec::DecodeError;
pub use id::{ContentHasher, ContentId, DigestScheme};
pub use manifest::{Manifest, ManifestEntry};
pub use scan::Scanner;
pub use store::{PersistStats, RestoreStats, Store, StoreError};

/// Common result type used throughout timepoint-core
pub type Result<T> = anyhow::Result<T>;
