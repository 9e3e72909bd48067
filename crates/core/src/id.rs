//! Content digest primitives for content-addressed storage

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Files at or above this size are hashed through a memory map
/// instead of a buffered read.
const MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Digest algorithm used to identify blob content.
///
/// Chosen once when a store is created and recorded in its config;
/// every snapshot written to that store uses the same scheme.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestScheme {
    Blake3,
    Sha256,
}

impl DigestScheme {
    /// One-byte tag used in the binary encoding of a [`ContentId`].
    pub fn tag(&self) -> u8 {
        match self {
            DigestScheme::Blake3 => 1,
            DigestScheme::Sha256 => 2,
        }
    }

    /// Reverse of [`DigestScheme::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DigestScheme::Blake3),
            2 => Some(DigestScheme::Sha256),
            _ => None,
        }
    }

    /// Compute the content id of a byte slice.
    pub fn identify_bytes(&self, data: &[u8]) -> ContentId {
        let mut hasher = ContentHasher::new(*self);
        hasher.update(data);
        hasher.finalize()
    }

    /// Compute the content id of a file's full content.
    ///
    /// Small files are read through an 8 KiB buffer; larger ones are
    /// memory-mapped to avoid the copy.
    pub fn identify_file(&self, path: &Path) -> Result<ContentId> {
        use std::fs::File;
        use std::io::{BufReader, Read};

        let file = File::open(path)?;
        let len = file.metadata()?.len();

        if len >= MMAP_THRESHOLD {
            let mmap = unsafe { memmap2::Mmap::map(&file)? };
            return Ok(self.identify_bytes(&mmap));
        }

        let mut reader = BufReader::new(file);
        let mut hasher = ContentHasher::new(*self);
        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(hasher.finalize())
    }
}

impl std::fmt::Display for DigestScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestScheme::Blake3 => write!(f, "blake3"),
            DigestScheme::Sha256 => write!(f, "sha256"),
        }
    }
}

/// A 256-bit content digest tagged with the scheme that produced it.
///
/// Two byte-identical inputs produce the same id under the same scheme,
/// regardless of path or timestamp. Ids from different schemes never
/// compare equal.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ContentId {
    Blake3([u8; 32]),
    Sha256([u8; 32]),
}

impl ContentId {
    /// Length of the fixed-width binary encoding: scheme tag + digest.
    pub const ENCODED_LEN: usize = 33;

    /// Assemble an id from a scheme and raw digest bytes.
    pub const fn from_parts(scheme: DigestScheme, bytes: [u8; 32]) -> Self {
        match scheme {
            DigestScheme::Blake3 => ContentId::Blake3(bytes),
            DigestScheme::Sha256 => ContentId::Sha256(bytes),
        }
    }

    /// The scheme that produced this id.
    pub fn scheme(&self) -> DigestScheme {
        match self {
            ContentId::Blake3(_) => DigestScheme::Blake3,
            ContentId::Sha256(_) => DigestScheme::Sha256,
        }
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        match self {
            ContentId::Blake3(bytes) | ContentId::Sha256(bytes) => bytes,
        }
    }

    /// Fixed-width binary form: scheme tag byte followed by the digest.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0] = self.scheme().tag();
        out[1..].copy_from_slice(self.as_bytes());
        out
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        const HEX_CHARS: &[u8] = b"0123456789abcdef";
        let mut hex = String::with_capacity(64);
        for &byte in self.as_bytes() {
            hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
            hex.push(HEX_CHARS[(byte & 0xf) as usize] as char);
        }
        hex
    }

    /// Parse from hex string
    pub fn from_hex(scheme: DigestScheme, hex: &str) -> Result<Self> {
        if hex.len() != 64 {
            anyhow::bail!("Invalid hex length: expected 64 characters, got {}", hex.len());
        }

        let mut bytes = [0u8; 32];
        for i in 0..32 {
            let high = hex_char_to_nibble(hex.as_bytes()[i * 2])?;
            let low = hex_char_to_nibble(hex.as_bytes()[i * 2 + 1])?;
            bytes[i] = (high << 4) | low;
        }
        Ok(Self::from_parts(scheme, bytes))
    }
}

/// Helper function to convert a hex character to a nibble
fn hex_char_to_nibble(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => anyhow::bail!("Invalid hex character: {}", c as char),
    }
}

impl std::fmt::Debug for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentId({}:{})", self.scheme(), self.to_hex())
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental hasher for building content ids across multiple chunks
pub enum ContentHasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(Sha256),
}

impl ContentHasher {
    /// Create a new incremental hasher for the given scheme
    pub fn new(scheme: DigestScheme) -> Self {
        match scheme {
            DigestScheme::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
            DigestScheme::Sha256 => ContentHasher::Sha256(Sha256::new()),
        }
    }

    /// Update the hash with more data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Blake3(hasher) => {
                hasher.update(data);
            }
            ContentHasher::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the content id
    pub fn finalize(self) -> ContentId {
        match self {
            ContentHasher::Blake3(hasher) => ContentId::Blake3(*hasher.finalize().as_bytes()),
            ContentHasher::Sha256(hasher) => ContentId::Sha256(hasher.finalize().into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_identify_consistency() {
        for scheme in [DigestScheme::Blake3, DigestScheme::Sha256] {
            let id1 = scheme.identify_bytes(b"hello world");
            let id2 = scheme.identify_bytes(b"hello world");
            assert_eq!(id1, id2);
            assert_eq!(id1.scheme(), scheme);
        }
    }

    #[test]
    fn test_different_data_different_id() {
        let id1 = DigestScheme::Blake3.identify_bytes(b"hello");
        let id2 = DigestScheme::Blake3.identify_bytes(b"world");
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_schemes_never_compare_equal() {
        let blake = DigestScheme::Blake3.identify_bytes(b"same input");
        let sha = DigestScheme::Sha256.identify_bytes(b"same input");
        assert_ne!(blake, sha);
    }

    #[test]
    fn test_hex_encoding_roundtrip() {
        let original = ContentId::from_parts(DigestScheme::Sha256, [42; 32]);
        let hex = original.to_hex();
        let decoded = ContentId::from_hex(DigestScheme::Sha256, &hex).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_hex_encoding_lowercase() {
        let pattern = [0xde, 0xad, 0xbe, 0xef];
        let mut bytes = [0u8; 32];
        for (i, &byte) in pattern.iter().cycle().take(32).enumerate() {
            bytes[i] = byte;
        }
        let id = ContentId::from_parts(DigestScheme::Blake3, bytes);
        let hex = id.to_hex();
        assert!(hex.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(hex.len(), 64);
    }

    #[test]
    fn test_hex_decoding_invalid_length() {
        assert!(ContentId::from_hex(DigestScheme::Blake3, "abc").is_err());
        assert!(ContentId::from_hex(DigestScheme::Blake3, "").is_err());
        assert!(ContentId::from_hex(DigestScheme::Blake3, &"a".repeat(63)).is_err());
    }

    #[test]
    fn test_hex_decoding_invalid_chars() {
        let invalid = "g".repeat(64);
        assert!(ContentId::from_hex(DigestScheme::Blake3, &invalid).is_err());
    }

    #[test]
    fn test_binary_encoding_roundtrip() {
        let id = DigestScheme::Sha256.identify_bytes(b"payload");
        let encoded = id.encode();
        assert_eq!(encoded.len(), ContentId::ENCODED_LEN);

        let scheme = DigestScheme::from_tag(encoded[0]).unwrap();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&encoded[1..]);
        assert_eq!(ContentId::from_parts(scheme, bytes), id);
    }

    #[test]
    fn test_unknown_scheme_tag() {
        assert!(DigestScheme::from_tag(0).is_none());
        assert!(DigestScheme::from_tag(99).is_none());
    }

    #[test]
    fn test_incremental_hasher() {
        for scheme in [DigestScheme::Blake3, DigestScheme::Sha256] {
            let direct = scheme.identify_bytes(b"hello world");

            let mut incremental = ContentHasher::new(scheme);
            incremental.update(b"hello ");
            incremental.update(b"world");
            assert_eq!(direct, incremental.finalize());
        }
    }

    #[test]
    fn test_identify_file() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file_path = temp_dir.path().join("test.txt");

        let data = b"test file content";
        std::fs::write(&file_path, data)?;

        for scheme in [DigestScheme::Blake3, DigestScheme::Sha256] {
            let from_file = scheme.identify_file(&file_path)?;
            let from_bytes = scheme.identify_bytes(data);
            assert_eq!(from_file, from_bytes);
        }
        Ok(())
    }

    #[test]
    fn test_identify_large_file_uses_same_digest() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file_path = temp_dir.path().join("large.bin");

        // 5 MiB, enough to cross the mmap threshold
        let mut file = std::fs::File::create(&file_path)?;
        let chunk = vec![0xAB; 1024 * 1024];
        for _ in 0..5 {
            file.write_all(&chunk)?;
        }
        drop(file);

        let whole = std::fs::read(&file_path)?;
        let from_file = DigestScheme::Blake3.identify_file(&file_path)?;
        assert_eq!(from_file, DigestScheme::Blake3.identify_bytes(&whole));
        Ok(())
    }

    #[test]
    fn test_identify_empty_data() {
        let id1 = DigestScheme::Blake3.identify_bytes(b"");
        let id2 = DigestScheme::Blake3.identify_bytes(b"");
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_identify_missing_file() {
        let result = DigestScheme::Blake3.identify_file(Path::new("/nonexistent/file"));
        assert!(result.is_err());
    }
}
