//! Saved snapshots: named, timestamped manifests on disk
//!
//! A snapshot file is the durable record of one backup. Format
//! (version 1):
//! - magic: "TPS" + version byte '1' (4 bytes)
//! - name_len: u16, name bytes (UTF-8)
//! - created_at_ms: u64
//! - manifest payload (see `timepoint_core::codec`)

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use thiserror::Error;
use timepoint_core::store::atomic_write;
use timepoint_core::{codec, DecodeError, Manifest};

const MAGIC: &[u8; 3] = b"TPS";
const VERSION: u8 = b'1';

/// File extension for snapshot files
pub const SNAPSHOT_EXT: &str = "tps";

/// Longest accepted snapshot name
const MAX_NAME_LEN: usize = 128;

/// Why a snapshot file failed to decode.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("not a snapshot file: bad magic bytes")]
    BadMagic,
    #[error("unsupported snapshot version {0:?}")]
    UnsupportedVersion(char),
    #[error("truncated snapshot file: {0}")]
    Truncated(&'static str),
    #[error("snapshot name is not valid UTF-8")]
    InvalidName,
    #[error(transparent)]
    Manifest(#[from] DecodeError),
}

/// Identity of one saved snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    /// Creation time (Unix milliseconds)
    pub created_at_ms: u64,
}

/// A saved snapshot: its identity plus the manifest it captured.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub info: SnapshotInfo,
    pub manifest: Manifest,
}

/// Check that a name is usable as a snapshot file name.
///
/// Alphanumeric plus hyphens/underscores only, so names map onto file
/// names without escaping.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("snapshot name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        anyhow::bail!("snapshot name longer than {} bytes", MAX_NAME_LEN);
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!("invalid snapshot name: must be alphanumeric with hyphens/underscores");
    }
    Ok(())
}

impl Snapshot {
    /// Bundle a manifest under a validated name and timestamp
    pub fn new(name: &str, created_at_ms: u64, manifest: Manifest) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            info: SnapshotInfo {
                name: name.to_string(),
                created_at_ms,
            },
            manifest,
        })
    }

    /// Encode into the version-1 snapshot file form
    pub fn encode(&self) -> Vec<u8> {
        let name = self.info.name.as_bytes();

        let mut bytes = Vec::with_capacity(4 + 2 + name.len() + 8);
        bytes.extend_from_slice(MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&self.info.created_at_ms.to_le_bytes());
        bytes.extend_from_slice(&codec::encode(&self.manifest));
        bytes
    }

    /// Decode a version-1 snapshot file
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < 6 {
            return Err(SnapshotError::Truncated("header"));
        }
        if &bytes[0..3] != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        if bytes[3] != VERSION {
            return Err(SnapshotError::UnsupportedVersion(bytes[3] as char));
        }

        let name_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let mut offset = 6;

        if offset + name_len + 8 > bytes.len() {
            return Err(SnapshotError::Truncated("name and timestamp"));
        }
        let name = std::str::from_utf8(&bytes[offset..offset + name_len])
            .map_err(|_| SnapshotError::InvalidName)?
            .to_string();
        offset += name_len;

        let created_at_ms = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
        offset += 8;

        let manifest = codec::decode(&bytes[offset..])?;

        Ok(Self {
            info: SnapshotInfo {
                name,
                created_at_ms,
            },
            manifest,
        })
    }

    /// Write this snapshot into `dir` atomically, staging through `tmp_dir`.
    ///
    /// Returns the path of the written file.
    pub fn write_to_dir(&self, dir: &Path, tmp_dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}.{}", self.info.name, SNAPSHOT_EXT));
        atomic_write(tmp_dir, &path, &self.encode())
            .with_context(|| format!("Failed to write snapshot {}", self.info.name))?;
        Ok(path)
    }

    /// Read and decode a snapshot file
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read snapshot file {}", path.display()))?;
        let snapshot = Self::decode(&bytes)
            .with_context(|| format!("Failed to decode snapshot file {}", path.display()))?;
        Ok(snapshot)
    }
}

/// Current wall-clock time as Unix milliseconds
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
