//! Enumeration of saved snapshots
//!
//! The catalog is a view over the store's snapshots directory. Listing
//! is a lazy, finite, restartable pass: each call to [`Catalog::iter`]
//! walks the directory once and decodes files on demand, never
//! materializing an unbounded list up front.

use crate::snapshot::{validate_name, Snapshot, SnapshotInfo, SNAPSHOT_EXT};
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use timepoint_core::Manifest;

/// View over the snapshot files in one directory.
pub struct Catalog {
    dir: PathBuf,
}

impl Catalog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The directory this catalog reads
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a snapshot with the given name would occupy
    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, SNAPSHOT_EXT))
    }

    /// Lazily iterate over every saved snapshot.
    ///
    /// Files are decoded one at a time as the iterator advances; a
    /// snapshot that fails to decode surfaces as an `Err` item rather
    /// than being skipped.
    pub fn iter(&self) -> Result<SnapshotIter> {
        let entries = if self.dir.exists() {
            Some(fs::read_dir(&self.dir)?)
        } else {
            None
        };
        Ok(SnapshotIter { entries })
    }

    /// Lazily iterate over the manifests of every saved snapshot.
    ///
    /// The liveness input for blob sweeping.
    pub fn manifests(&self) -> Result<impl Iterator<Item = Result<Manifest>>> {
        Ok(self.iter()?.map(|item| item.map(|s| s.manifest)))
    }

    /// List every snapshot's identity, oldest first
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let mut infos = Vec::new();
        for snapshot in self.iter()? {
            infos.push(snapshot?.info);
        }
        infos.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(infos)
    }

    /// Load the snapshot with the given name, if it exists
    pub fn find(&self, name: &str) -> Result<Option<Snapshot>> {
        validate_name(name)?;
        let path = self.snapshot_path(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Snapshot::read_from_file(&path)?))
    }

    /// The most recently created snapshot, if any
    pub fn latest(&self) -> Result<Option<SnapshotInfo>> {
        Ok(self.list()?.into_iter().last())
    }
}

/// One pass over a snapshots directory.
pub struct SnapshotIter {
    entries: Option<fs::ReadDir>,
}

impl Iterator for SnapshotIter {
    type Item = Result<Snapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        loop {
            let entry = match entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            return Some(Snapshot::read_from_file(&path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use timepoint_core::{DigestScheme, ManifestEntry};

    fn manifest_of(data: &[u8]) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.insert(
            &PathBuf::from("f.dat"),
            ManifestEntry {
                id: DigestScheme::Blake3.identify_bytes(data),
                size: data.len() as u64,
                mtime_ms: 1,
            },
        );
        manifest
    }

    fn write_snapshot(dir: &Path, name: &str, created_at_ms: u64) {
        let snapshot = Snapshot::new(name, created_at_ms, manifest_of(name.as_bytes())).unwrap();
        snapshot.write_to_dir(dir, &dir.join("tmp")).unwrap();
    }

    #[test]
    fn test_missing_directory_is_empty() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let catalog = Catalog::new(temp_dir.path().join("never-created"));
        assert_eq!(catalog.iter()?.count(), 0);
        assert!(catalog.list()?.is_empty());
        assert!(catalog.latest()?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_sorted_by_creation_time() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_snapshot(temp_dir.path(), "newest", 300);
        write_snapshot(temp_dir.path(), "oldest", 100);
        write_snapshot(temp_dir.path(), "middle", 200);

        let catalog = Catalog::new(temp_dir.path().to_path_buf());
        let names: Vec<_> = catalog.list()?.into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["oldest", "middle", "newest"]);
        assert_eq!(catalog.latest()?.unwrap().name, "newest");
        Ok(())
    }

    #[test]
    fn test_iter_ignores_foreign_files() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_snapshot(temp_dir.path(), "real", 1);
        fs::write(temp_dir.path().join("notes.txt"), b"not a snapshot")?;

        let catalog = Catalog::new(temp_dir.path().to_path_buf());
        assert_eq!(catalog.iter()?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_iter_surfaces_corrupt_snapshot() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_snapshot(temp_dir.path(), "good", 1);
        fs::write(temp_dir.path().join("bad.tps"), b"TPS1 garbage")?;

        let catalog = Catalog::new(temp_dir.path().to_path_buf());
        let results: Vec<_> = catalog.iter()?.collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        Ok(())
    }

    #[test]
    fn test_iter_is_restartable() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_snapshot(temp_dir.path(), "one", 1);

        let catalog = Catalog::new(temp_dir.path().to_path_buf());
        assert_eq!(catalog.iter()?.count(), 1);
        // A fresh pass sees newly added files
        write_snapshot(temp_dir.path(), "two", 2);
        assert_eq!(catalog.iter()?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_find() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        write_snapshot(temp_dir.path(), "present", 9);

        let catalog = Catalog::new(temp_dir.path().to_path_buf());
        let found = catalog.find("present")?.unwrap();
        assert_eq!(found.info.name, "present");
        assert_eq!(found.info.created_at_ms, 9);

        assert!(catalog.find("absent")?.is_none());
        // Names that cannot be file names are rejected, not probed
        assert!(catalog.find("../escape").is_err());
        Ok(())
    }
}
