//! # Content Digest
//!
//! SHA-256 checksums of artifact content. Checksums are always computed by
//! the storage engine from the bytes it actually wrote; callers never
//! supply one.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// A SHA-256 digest of artifact content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render the digest as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse a 64-character hex string (either case).
    pub fn from_hex(hex: &str) -> Result<Self, ValidationError> {
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(ValidationError::InvalidDigest(hex.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| ValidationError::InvalidDigest(hex.to_string()))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| ValidationError::InvalidDigest(hex.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Compute the SHA-256 digest of an in-memory buffer.
pub fn sha256_digest(data: &[u8]) -> ContentDigest {
    let hash = Sha256::digest(data);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hash);
    ContentDigest(bytes)
}

/// Incremental SHA-256 over a byte stream, tracking the byte count.
#[derive(Clone, Default)]
pub struct Sha256Accumulator {
    hasher: Sha256,
    len: u64,
}

impl Sha256Accumulator {
    /// Start a new accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of content.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Total bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been fed yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish hashing.
    pub fn finalize(self) -> ContentDigest {
        let hash = self.hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        ContentDigest(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sha256_vector() {
        // SHA256("") is a well-known constant.
        assert_eq!(
            sha256_digest(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_accumulator_matches_one_shot() {
        let data = b"artifact content spread over several chunks";
        let mut acc = Sha256Accumulator::new();
        assert!(acc.is_empty());
        for chunk in data.chunks(7) {
            acc.update(chunk);
        }
        assert_eq!(acc.len(), data.len() as u64);
        assert_eq!(acc.finalize(), sha256_digest(data));
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = sha256_digest(b"podinfo");
        let parsed = ContentDigest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(parsed, digest);
        let upper = ContentDigest::from_hex(&digest.to_hex().to_uppercase()).unwrap();
        assert_eq!(upper, digest);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ContentDigest::from_hex("abc").is_err());
        assert!(ContentDigest::from_hex(&"g".repeat(64)).is_err());
        assert!(ContentDigest::from_hex(&"é".repeat(32)).is_err());
    }

    #[test]
    fn test_serializes_as_hex_string() {
        let digest = sha256_digest(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.to_hex()));
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
