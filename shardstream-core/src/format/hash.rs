// shardstream-core/src/format/hash.rs

//! Content hashes recorded for shard files.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use twox_hash::XxHash64;

use crate::error::{Result, StreamError};

/// Supported hash algorithms.
///
/// `Xxh64` is the fast non-cryptographic check used on every cache load;
/// `Sha256` is available when a cryptographic digest is wanted as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    Xxh64,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Xxh64 => "xxh64",
            Self::Sha256 => "sha256",
        }
    }

    /// Hashes `data` and returns the lowercase hex digest.
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            Self::Xxh64 => {
                let mut hasher = XxHash64::with_seed(0);
                hasher.write(data);
                format!("{:016x}", hasher.finish())
            }
            Self::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }

    /// Checks `data` against an expected hex digest.
    pub fn verify(&self, shard: usize, data: &[u8], expected: &str) -> Result<()> {
        let actual = self.digest(data);
        if actual.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(StreamError::HashMismatch {
                shard,
                algorithm: self.name().to_string(),
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

/// Digests of one file, keyed by algorithm name.
pub fn digest_all(algorithms: &[HashAlgorithm], data: &[u8]) -> BTreeMap<String, String> {
    algorithms
        .iter()
        .map(|algo| (algo.name().to_string(), algo.digest(data)))
        .collect()
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "xxh64" => Ok(Self::Xxh64),
            "sha256" => Ok(Self::Sha256),
            _ => Err(StreamError::config(format!(
                "unknown hash algorithm '{s}', expected xxh64 or sha256"
            ))),
        }
    }
}

impl Serialize for HashAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for HashAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            HashAlgorithm::Sha256.digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_xxh64_is_stable_and_sensitive() {
        let a = HashAlgorithm::Xxh64.digest(b"hello world");
        assert_eq!(a, HashAlgorithm::Xxh64.digest(b"hello world"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, HashAlgorithm::Xxh64.digest(b"hello worle"));
    }

    #[test]
    fn test_verify() {
        let digest = HashAlgorithm::Xxh64.digest(b"payload");
        assert!(HashAlgorithm::Xxh64.verify(0, b"payload", &digest).is_ok());

        let err = HashAlgorithm::Xxh64.verify(4, b"tampered", &digest).unwrap_err();
        assert!(matches!(err, StreamError::HashMismatch { shard: 4, .. }));
    }

    #[test]
    fn test_digest_all_keys() {
        let digests = digest_all(&[HashAlgorithm::Sha256, HashAlgorithm::Xxh64], b"x");
        assert_eq!(digests.len(), 2);
        assert!(digests.contains_key("sha256"));
        assert!(digests.contains_key("xxh64"));
    }

    #[test]
    fn test_parse() {
        assert_eq!("XXH64".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Xxh64);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}
