//! The engine facade: snapshot, restore, delete
//!
//! The two calls the host application drives ("build and persist a
//! snapshot of directory D", "materialize directory D from snapshot S")
//! plus named-snapshot deletion. Everything above this layer
//! (confirmation flows, pausing writers, restarting the application)
//! is the caller's concern.

use crate::catalog::Catalog;
use crate::snapshot::{now_ms, validate_name, Snapshot, SnapshotInfo};
use anyhow::{Context, Result};
use std::path::Path;
use timepoint_core::{DigestScheme, RestoreStats, Scanner, Store};

/// Outcome of one snapshot operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub info: SnapshotInfo,
    /// Files captured in the manifest
    pub files: usize,
    /// Blobs this snapshot added to the store
    pub new_blobs: usize,
    /// Bytes written for those blobs, including headers
    pub bytes_written: u64,
}

/// A snapshot archive over one store directory.
///
/// An explicit value the caller owns and passes around; there is no
/// process-wide current archive.
#[derive(Debug)]
pub struct Archive {
    store: Store,
}

impl Archive {
    /// Open the archive at `base`, creating the store on first use.
    pub fn open(base: &Path, scheme: DigestScheme) -> Result<Self> {
        Ok(Self {
            store: Store::open_or_create(base, scheme)?,
        })
    }

    /// The underlying blob store
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Catalog over this archive's saved snapshots
    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.store.snapshots_dir())
    }

    /// Capture `source_root` as a named snapshot, sizing the scanner to
    /// the machine.
    pub fn snapshot(&self, name: &str, source_root: &Path) -> Result<SnapshotReport> {
        let scanner = Scanner::with_defaults(self.store.scheme());
        self.snapshot_with(name, source_root, &scanner)
    }

    /// Capture `source_root` as a named snapshot using a configured scanner.
    ///
    /// The snapshot file is written only after every referenced blob is
    /// durable, so no partial snapshot is ever visible in the catalog.
    pub fn snapshot_with(
        &self,
        name: &str,
        source_root: &Path,
        scanner: &Scanner,
    ) -> Result<SnapshotReport> {
        validate_name(name)?;
        let catalog = self.catalog();
        if catalog.snapshot_path(name).exists() {
            anyhow::bail!("snapshot {} already exists", name);
        }

        let manifest = scanner
            .scan(source_root)
            .with_context(|| format!("Failed to scan {}", source_root.display()))?;
        let stats = self.store.persist(&manifest, source_root)?;

        let files = manifest.len();
        let snapshot = Snapshot::new(name, now_ms(), manifest)?;
        snapshot.write_to_dir(catalog.dir(), &self.store.base().join("tmp/ingest"))?;

        tracing::debug!(
            name,
            files,
            new_blobs = stats.new_blobs,
            "snapshot persisted"
        );

        Ok(SnapshotReport {
            info: snapshot.info,
            files,
            new_blobs: stats.new_blobs,
            bytes_written: stats.bytes_written,
        })
    }

    /// Materialize the named snapshot into `target_root`.
    pub fn restore(&self, name: &str, target_root: &Path) -> Result<RestoreStats> {
        let snapshot = self
            .catalog()
            .find(name)?
            .with_context(|| format!("no snapshot named {}", name))?;
        self.store.restore(&snapshot.manifest, target_root)
    }

    /// Delete the named snapshot and the blobs only it references.
    ///
    /// The snapshot file is removed first; the sweep then runs against
    /// the manifests of every snapshot still on disk. A crash between
    /// the two steps strands orphan blobs but can never break a
    /// retained snapshot. Returns the number of blobs removed.
    pub fn delete(&self, name: &str) -> Result<usize> {
        let catalog = self.catalog();
        let snapshot = catalog
            .find(name)?
            .with_context(|| format!("no snapshot named {}", name))?;

        std::fs::remove_file(catalog.snapshot_path(name))
            .with_context(|| format!("Failed to remove snapshot file for {}", name))?;

        let removed = self
            .store
            .sweep_unreferenced(&snapshot.manifest, catalog.manifests()?)?;

        tracing::debug!(name, removed, "snapshot deleted");
        Ok(removed)
    }

    /// Every saved snapshot, oldest first
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        self.catalog().list()
    }

    /// The most recently created snapshot, if any
    pub fn latest(&self) -> Result<Option<SnapshotInfo>> {
        self.catalog().latest()
    }
}
