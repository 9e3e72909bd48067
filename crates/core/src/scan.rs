//! Directory tree scanning and manifest construction
//!
//! Walks a live tree and produces the manifest describing it. Hashing
//! runs on the calling thread for small trees and fans out over a
//! worker pool for large ones; either way the resulting manifest is
//! value-identical, since manifest equality ignores ordering.

use crate::id::DigestScheme;
use crate::manifest::{Manifest, ManifestEntry};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Default file count below which hashing stays on the calling thread.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 128;

/// Builds a [`Manifest`] from a live directory tree.
pub struct Scanner {
    scheme: DigestScheme,
    threads: usize,
    parallel_threshold: usize,
}

impl Scanner {
    /// Create a scanner with an explicit worker count and threshold.
    ///
    /// If fewer files than `parallel_threshold` are discovered, hashing
    /// runs sequentially; a `threads` of 0 or 1 forces sequential mode.
    pub fn new(scheme: DigestScheme, threads: usize, parallel_threshold: usize) -> Self {
        Self {
            scheme,
            threads: threads.max(1),
            parallel_threshold,
        }
    }

    /// Create a scanner sized to the machine.
    pub fn with_defaults(scheme: DigestScheme) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(scheme, threads, DEFAULT_PARALLEL_THRESHOLD)
    }

    /// Walk `root` and produce the manifest of every regular file below it.
    ///
    /// Fails on the first unreadable or vanished file rather than
    /// producing a manifest that cannot be faithfully restored. Symlinks
    /// are an error: the manifest model carries only regular-file
    /// content, so a link can be neither captured nor skipped safely.
    pub fn scan(&self, root: &Path) -> Result<Manifest> {
        let files = self.enumerate_files(root)?;

        if files.len() < self.parallel_threshold || self.threads <= 1 {
            self.scan_sequential(root, files)
        } else {
            self.scan_parallel(root, files)
        }
    }

    /// Collect the relative path of every regular file under `root`
    fn enumerate_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.context("Failed to read directory entry")?;

            if entry.file_type().is_symlink() {
                anyhow::bail!(
                    "cannot snapshot symlink {}: links are not representable in a manifest",
                    entry.path().display()
                );
            }
            if entry.file_type().is_dir() {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(root)
                .context("walked path escaped the scan root")?;
            files.push(rel.to_path_buf());
        }

        Ok(files)
    }

    fn scan_sequential(&self, root: &Path, files: Vec<PathBuf>) -> Result<Manifest> {
        let mut manifest = Manifest::new();
        for rel in files {
            let entry = self.hash_one(root, &rel)?;
            manifest.insert(&rel, entry);
        }
        Ok(manifest)
    }

    /// Fan-out/fan-in: workers pull paths from a shared queue and return
    /// their own entry lists; nothing is merged until every worker is done.
    fn scan_parallel(&self, root: &Path, files: Vec<PathBuf>) -> Result<Manifest> {
        let worker_count = self.threads.min(files.len());

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<PathBuf>();
        for rel in files {
            // Receiver outlives the loop, send cannot fail here
            let _ = job_tx.send(rel);
        }
        drop(job_tx);

        let partials: Vec<Result<Vec<(PathBuf, ManifestEntry)>>> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(worker_count);
            for _ in 0..worker_count {
                let job_rx = job_rx.clone();
                handles.push(scope.spawn(move || {
                    let mut entries = Vec::new();
                    while let Ok(rel) = job_rx.recv() {
                        let entry = self.hash_one(root, &rel)?;
                        entries.push((rel, entry));
                    }
                    Ok(entries)
                }));
            }
            handles
                .into_iter()
                .map(|handle| handle.join().expect("hash worker panicked"))
                .collect()
        });

        let mut manifest = Manifest::new();
        for partial in partials {
            for (rel, entry) in partial? {
                manifest.insert(&rel, entry);
            }
        }
        Ok(manifest)
    }

    /// Stat and digest a single file
    fn hash_one(&self, root: &Path, rel: &Path) -> Result<ManifestEntry> {
        let abs = root.join(rel);

        let metadata = std::fs::metadata(&abs)
            .with_context(|| format!("Failed to stat {}", abs.display()))?;
        let mtime_ms = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .context("file modification time predates the Unix epoch")?
            .as_millis() as u64;

        let id = self
            .scheme
            .identify_file(&abs)
            .with_context(|| format!("Failed to hash {}", abs.display()))?;

        Ok(ManifestEntry {
            id,
            size: metadata.len(),
            mtime_ms,
        })
    }
}
