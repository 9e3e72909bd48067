//! Binary encoding of manifests
//!
//! Format (version 1):
//! - magic: "TPM" + version byte '1' (4 bytes)
//! - entry_count: u32
//! - entries (sorted lexicographically by path):
//!   - path_len: u16
//!   - path_bytes: [u8; path_len] (UTF-8, '/'-separated)
//!   - scheme_tag: u8
//!   - digest: [u8; 32]
//!   - size: u64
//!   - mtime_ms: u64
//!
//! All integers little-endian. The format is self-describing: decoding
//! truncated, version-mismatched, or corrupted input fails with a
//! [`DecodeError`] and never yields a partially populated manifest.

use crate::id::{ContentId, DigestScheme};
use crate::manifest::{Manifest, ManifestEntry};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 3] = b"TPM";
const VERSION: u8 = b'1';
const HEADER_LEN: usize = 8;

/// Why a manifest payload failed to decode.
///
/// Kept distinct from I/O errors so callers can tell bad input from a
/// bad environment.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a manifest: bad magic bytes")]
    BadMagic,
    #[error("unsupported manifest version {0:?}")]
    UnsupportedVersion(char),
    #[error("truncated manifest: {0}")]
    Truncated(&'static str),
    #[error("unknown digest scheme tag {0}")]
    UnknownScheme(u8),
    #[error("manifest path is not valid UTF-8")]
    InvalidPath,
    #[error("duplicate manifest path {0:?}")]
    DuplicatePath(String),
    #[error("{0} trailing bytes after last manifest entry")]
    TrailingBytes(usize),
}

/// Encode a manifest into its version-1 binary form.
///
/// Entries are written in sorted path order, so two equal manifests
/// always encode to identical bytes.
pub fn encode(manifest: &Manifest) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + manifest.len() * 64);

    bytes.extend_from_slice(MAGIC);
    bytes.push(VERSION);
    bytes.extend_from_slice(&(manifest.len() as u32).to_le_bytes());

    for (path, entry) in manifest.sorted_entries() {
        bytes.extend_from_slice(&(path.len() as u16).to_le_bytes());
        bytes.extend_from_slice(path);
        bytes.push(entry.id.scheme().tag());
        bytes.extend_from_slice(entry.id.as_bytes());
        bytes.extend_from_slice(&entry.size.to_le_bytes());
        bytes.extend_from_slice(&entry.mtime_ms.to_le_bytes());
    }

    bytes
}

/// Decode a version-1 manifest payload.
pub fn decode(bytes: &[u8]) -> Result<Manifest, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated("header"));
    }
    if &bytes[0..3] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    if bytes[3] != VERSION {
        return Err(DecodeError::UnsupportedVersion(bytes[3] as char));
    }

    let entry_count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    let mut manifest = Manifest::new();
    let mut offset = HEADER_LEN;

    for _ in 0..entry_count {
        if offset + 2 > bytes.len() {
            return Err(DecodeError::Truncated("path length"));
        }
        let path_len = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        offset += 2;

        if offset + path_len > bytes.len() {
            return Err(DecodeError::Truncated("path bytes"));
        }
        let path_str = std::str::from_utf8(&bytes[offset..offset + path_len])
            .map_err(|_| DecodeError::InvalidPath)?;
        offset += path_len;

        if offset + 1 + 32 + 8 + 8 > bytes.len() {
            return Err(DecodeError::Truncated("entry fields"));
        }

        let scheme =
            DigestScheme::from_tag(bytes[offset]).ok_or(DecodeError::UnknownScheme(bytes[offset]))?;
        offset += 1;

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[offset..offset + 32]);
        offset += 32;

        let size = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
        offset += 8;
        let mtime_ms = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
        offset += 8;

        let entry = ManifestEntry {
            id: ContentId::from_parts(scheme, digest),
            size,
            mtime_ms,
        };

        if manifest.insert(Path::new(path_str), entry).is_some() {
            return Err(DecodeError::DuplicatePath(path_str.to_string()));
        }
    }

    if offset != bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - offset));
    }

    Ok(manifest)
}
