//! Content-addressed blob store
//!
//! Owns the physical storage for snapshot blobs:
//! ```text
//! <base>/
//!   config.toml          store version, digest scheme, compression threshold
//!   locks/               operation lock files
//!   objects/blobs/       content-addressed blobs, 2-hex-char fan-out
//!   snapshots/           one snapshot file per saved backup
//!   tmp/ingest/          staging for atomic writes
//! ```
//! Blob writes are append-only and idempotent; a stored blob's bytes are
//! never mutated in place. Callers must serialize mutating operations
//! (persist, restore, sweep) against one base directory; a lock file makes
//! a violation fail loudly instead of corrupting state.

use crate::id::{ContentId, DigestScheme};
use crate::manifest::Manifest;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

const STORE_VERSION: u32 = 1;
const DEFAULT_COMPRESS_THRESHOLD: u64 = 4096;

/// Store failures callers must be able to tell apart from plain I/O.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob {0} is missing from the store")]
    MissingBlob(String),
    #[error("blob {id} is corrupt: {reason}")]
    CorruptBlob { id: String, reason: String },
    #[error("store uses digest scheme {stored}, requested {requested}")]
    SchemeMismatch {
        stored: DigestScheme,
        requested: DigestScheme,
    },
    #[error("another operation holds the store lock at {0}")]
    Busy(PathBuf),
}

/// Persisted store settings, pinned at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub version: u32,
    /// Digest scheme every snapshot in this store uses. Mixing schemes
    /// would silently break dedup, so it is fixed for the store's lifetime.
    pub scheme: DigestScheme,
    /// Blobs larger than this are zstd-compressed when that helps.
    /// 0 disables compression.
    pub compress_threshold: u64,
}

/// Result of persisting a manifest's blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    /// Blobs newly written by this call (already-present ids are skipped)
    pub new_blobs: usize,
    /// Bytes written to disk, including blob headers
    pub bytes_written: u64,
}

/// Result of materializing a manifest into a target tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub files_written: usize,
    pub bytes_written: u64,
}

/// Blob file header (version 1)
///
/// Layout: magic(4) + flags(1) + orig_len(8) + stored_len(8) = 21 bytes.
#[derive(Debug, Clone)]
struct BlobHeader {
    flags: u8,
    orig_len: u64,
    stored_len: u64,
}

impl BlobHeader {
    const MAGIC: [u8; 4] = *b"TPB1";
    const FLAG_COMPRESSED: u8 = 0b0000_0001;
    const LEN: usize = 21;

    fn new(orig_len: u64, stored_len: u64, compressed: bool) -> Self {
        Self {
            flags: if compressed { Self::FLAG_COMPRESSED } else { 0 },
            orig_len,
            stored_len,
        }
    }

    fn is_compressed(&self) -> bool {
        (self.flags & Self::FLAG_COMPRESSED) != 0
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LEN);
        bytes.extend_from_slice(&Self::MAGIC);
        bytes.push(self.flags);
        bytes.extend_from_slice(&self.orig_len.to_le_bytes());
        bytes.extend_from_slice(&self.stored_len.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            anyhow::bail!("blob header truncated: {} bytes", bytes.len());
        }
        if bytes[0..4] != Self::MAGIC {
            anyhow::bail!("bad blob magic bytes");
        }
        Ok(Self {
            flags: bytes[4],
            orig_len: u64::from_le_bytes(bytes[5..13].try_into().unwrap()),
            stored_len: u64::from_le_bytes(bytes[13..21].try_into().unwrap()),
        })
    }
}

/// Exclusive guard over mutating operations on one store directory.
///
/// Backed by a lock file so the exclusion also holds across processes.
/// Dropped (and the file removed) when the operation finishes.
#[derive(Debug)]
struct OperationLock {
    path: PathBuf,
}

impl OperationLock {
    fn acquire(locks_dir: &Path) -> Result<Self> {
        fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join("op.lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::Busy(path).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// The deduplicating blob store over one base directory.
#[derive(Debug)]
pub struct Store {
    base: PathBuf,
    config: StoreConfig,
    /// Presence cache: ids known to exist on disk
    present: DashMap<ContentId, ()>,
}

impl Store {
    /// Initialize a new store at `base`
    pub fn create(base: &Path, scheme: DigestScheme) -> Result<Self> {
        let config_path = base.join("config.toml");
        if config_path.exists() {
            anyhow::bail!("store already initialized at {}", base.display());
        }

        fs::create_dir_all(base.join("locks"))?;
        fs::create_dir_all(base.join("objects/blobs"))?;
        fs::create_dir_all(base.join("snapshots"))?;
        fs::create_dir_all(base.join("tmp/ingest"))?;

        let config = StoreConfig {
            version: STORE_VERSION,
            scheme,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        };
        let rendered = toml::to_string_pretty(&config).context("Failed to render store config")?;
        atomic_write(&base.join("tmp/ingest"), &config_path, rendered.as_bytes())?;

        Ok(Self {
            base: base.to_path_buf(),
            config,
            present: DashMap::new(),
        })
    }

    /// Open an existing store
    pub fn open(base: &Path) -> Result<Self> {
        let config_path = base.join("config.toml");
        if !config_path.exists() {
            anyhow::bail!("store not initialized at {}", base.display());
        }

        let content = fs::read_to_string(&config_path).context("Failed to read store config")?;
        let config: StoreConfig =
            toml::from_str(&content).context("Failed to parse store config")?;
        if config.version != STORE_VERSION {
            anyhow::bail!("unsupported store version {}", config.version);
        }

        for dir in ["locks", "objects/blobs", "snapshots", "tmp/ingest"] {
            if !base.join(dir).exists() {
                anyhow::bail!("store is missing required directory {}", dir);
            }
        }

        Ok(Self {
            base: base.to_path_buf(),
            config,
            present: DashMap::new(),
        })
    }

    /// Open `base` if it is already a store, otherwise create it.
    ///
    /// Fails with [`StoreError::SchemeMismatch`] if an existing store was
    /// created under a different digest scheme.
    pub fn open_or_create(base: &Path, scheme: DigestScheme) -> Result<Self> {
        if base.join("config.toml").exists() {
            let store = Self::open(base)?;
            if store.config.scheme != scheme {
                return Err(StoreError::SchemeMismatch {
                    stored: store.config.scheme,
                    requested: scheme,
                }
                .into());
            }
            Ok(store)
        } else {
            Self::create(base, scheme)
        }
    }

    /// The digest scheme this store was created with
    pub fn scheme(&self) -> DigestScheme {
        self.config.scheme
    }

    /// The store's base directory
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding one snapshot file per saved backup
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base.join("snapshots")
    }

    /// Check whether a blob is present
    pub fn contains(&self, id: ContentId) -> bool {
        if self.present.contains_key(&id) {
            return true;
        }
        let on_disk = self.blob_path(id).exists();
        if on_disk {
            self.present.insert(id, ());
        }
        on_disk
    }

    /// Persist every blob a manifest references that is not yet stored.
    ///
    /// Source bytes are read from `source_root` (the live tree the
    /// manifest was scanned from) and re-verified against their recorded
    /// id before being written; a file that changed since the scan aborts
    /// the persist. Nothing already stored is written again, which keeps
    /// storage cost sub-linear in snapshot count for mostly-unchanged trees.
    pub fn persist(&self, manifest: &Manifest, source_root: &Path) -> Result<PersistStats> {
        let _lock = OperationLock::acquire(&self.base.join("locks"))?;

        // One representative source path per distinct id
        let mut sources: HashMap<ContentId, &[u8]> = HashMap::new();
        for (path, entry) in manifest.entries_with_paths() {
            sources.entry(entry.id).or_insert(path);
        }

        let mut stats = PersistStats::default();
        for (id, path_bytes) in sources {
            if self.contains(id) {
                continue;
            }

            let path_str =
                std::str::from_utf8(path_bytes).context("manifest path is not valid UTF-8")?;
            let source = source_root.join(path_str);
            let data = fs::read(&source)
                .with_context(|| format!("Failed to read {}", source.display()))?;

            // The tree is live; refuse to store bytes that no longer
            // match the manifest.
            let actual = self.config.scheme.identify_bytes(&data);
            if actual != id {
                anyhow::bail!(
                    "{} changed during persist: expected {}, content is now {}",
                    source.display(),
                    id,
                    actual
                );
            }

            stats.bytes_written += self.write_blob(id, &data)?;
            stats.new_blobs += 1;
        }

        Ok(stats)
    }

    /// Materialize a manifest into `target_root`.
    ///
    /// Every entry's blob must resolve; a missing blob is a fatal
    /// [`StoreError::MissingBlob`], never a silently skipped file. File
    /// content, size, and mtime are recreated; permission bits are not
    /// part of the manifest and are left to the process umask.
    pub fn restore(&self, manifest: &Manifest, target_root: &Path) -> Result<RestoreStats> {
        let _lock = OperationLock::acquire(&self.base.join("locks"))?;

        fs::create_dir_all(target_root)?;

        let mut stats = RestoreStats::default();
        for (path, entry) in manifest.entries_with_paths() {
            let path_str =
                std::str::from_utf8(path).context("manifest path is not valid UTF-8")?;
            let target = target_root.join(path_str);

            let data = self.read_blob(entry.id)?;
            if data.len() as u64 != entry.size {
                return Err(StoreError::CorruptBlob {
                    id: entry.id.to_hex(),
                    reason: format!(
                        "manifest records {} bytes, blob holds {}",
                        entry.size,
                        data.len()
                    ),
                }
                .into());
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            file.write_all(&data)?;
            file.set_modified(UNIX_EPOCH + Duration::from_millis(entry.mtime_ms))?;

            stats.files_written += 1;
            stats.bytes_written += data.len() as u64;
        }

        Ok(stats)
    }

    /// Delete the blobs only `target` references.
    ///
    /// Computes `target`'s id set minus the union of ids over all
    /// `retained` manifests and unlinks the remainder. A blob referenced
    /// by any retained manifest survives. The caller supplies the true
    /// set of still-retained manifests; no independent verification
    /// happens beyond it. Returns the number of blobs removed.
    pub fn sweep_unreferenced<I>(&self, target: &Manifest, retained: I) -> Result<usize>
    where
        I: IntoIterator<Item = Result<Manifest>>,
    {
        let _lock = OperationLock::acquire(&self.base.join("locks"))?;

        let mut live = std::collections::HashSet::new();
        for manifest in retained {
            let manifest = manifest.context("Failed to load a retained manifest")?;
            live.extend(manifest.distinct_ids());
        }

        let mut removed = 0;
        for id in target.distinct_ids() {
            // Membership is re-checked right before the unlink
            if live.contains(&id) {
                continue;
            }
            let path = self.blob_path(id);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete blob {}", id))?;
                self.present.remove(&id);
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Write one blob, idempotently. Returns bytes written (0 if the
    /// blob was already present).
    fn write_blob(&self, id: ContentId, data: &[u8]) -> Result<u64> {
        let blob_path = self.blob_path(id);
        if blob_path.exists() {
            self.present.insert(id, ());
            return Ok(0);
        }

        let orig_len = data.len() as u64;
        let threshold = self.config.compress_threshold;
        let should_compress = threshold > 0 && orig_len > threshold;

        let (stored, compressed) = if should_compress {
            match zstd::encode_all(data, 3) {
                // Only keep the compressed form when it actually shrinks
                Ok(encoded) if encoded.len() < data.len() => (encoded, true),
                _ => (data.to_vec(), false),
            }
        } else {
            (data.to_vec(), false)
        };

        let header = BlobHeader::new(orig_len, stored.len() as u64, compressed);
        let mut serialized = header.to_bytes();
        serialized.extend_from_slice(&stored);

        atomic_write(&self.base.join("tmp/ingest"), &blob_path, &serialized)?;
        self.present.insert(id, ());

        Ok(serialized.len() as u64)
    }

    /// Read and verify one blob.
    pub fn read_blob(&self, id: ContentId) -> Result<Vec<u8>> {
        let blob_path = self.blob_path(id);
        if !blob_path.exists() {
            return Err(StoreError::MissingBlob(id.to_hex()).into());
        }

        let serialized = fs::read(&blob_path)?;
        let data = decode_blob(&serialized).map_err(|e| StoreError::CorruptBlob {
            id: id.to_hex(),
            reason: e.to_string(),
        })?;

        let actual = id.scheme().identify_bytes(&data);
        if actual != id {
            tracing::warn!("blob {} stored bytes hash to {}", id, actual);
            return Err(StoreError::CorruptBlob {
                id: id.to_hex(),
                reason: format!("stored bytes hash to {}", actual),
            }
            .into());
        }

        Ok(data)
    }

    /// Filesystem path for a blob: objects/blobs/<first 2 hex chars>/<rest>
    fn blob_path(&self, id: ContentId) -> PathBuf {
        let hex = id.to_hex();
        let (prefix, rest) = hex.split_at(2);
        self.base.join("objects/blobs").join(prefix).join(rest)
    }
}

/// Strip the header from a serialized blob and decompress the payload
fn decode_blob(serialized: &[u8]) -> Result<Vec<u8>> {
    let header = BlobHeader::from_bytes(serialized)?;

    let data_start = BlobHeader::LEN;
    let data_end = data_start + header.stored_len as usize;
    if serialized.len() < data_end {
        anyhow::bail!(
            "blob payload truncated: header promises {} bytes, file holds {}",
            header.stored_len,
            serialized.len() - data_start
        );
    }
    let stored = &serialized[data_start..data_end];

    if header.is_compressed() {
        let decompressed = zstd::decode_all(stored)?;
        if decompressed.len() as u64 != header.orig_len {
            anyhow::bail!(
                "decompressed size mismatch: expected {}, got {}",
                header.orig_len,
                decompressed.len()
            );
        }
        Ok(decompressed)
    } else {
        Ok(stored.to_vec())
    }
}

/// Atomic write helper
///
/// Writes data to a temporary file, fsyncs it, then renames it to the
/// target path, fsyncing the parent directory afterwards.
pub fn atomic_write(tmp_dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    fs::create_dir_all(tmp_dir)?;
    let temp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());

    let mut temp_file = fs::File::create(&temp_path)?;
    temp_file.write_all(data)?;
    temp_file.sync_all()?;
    drop(temp_file);

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&temp_path, target)?;

    // Best effort, may fail on some filesystems
    if let Some(parent) = target.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}
