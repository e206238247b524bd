// shardstream-core/src/format/compression.rs

//! Shard compression algorithms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, StreamError};

/// Default zstd level when none is given.
const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression applied to a whole shard file.
///
/// Parsed from `"none"`, `"lz4"`, `"zstd"` or `"zstd:<level>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Compression {
    /// File extension used for shards compressed with this algorithm.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Lz4 => Some("lz4"),
            Self::Zstd { .. } => Some("zstd"),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Self::Zstd { level } => zstd::encode_all(data, *level)
                .map_err(|e| StreamError::compression("zstd", e.to_string())),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| StreamError::compression("lz4", e.to_string())),
            Self::Zstd { .. } => {
                zstd::decode_all(data).map_err(|e| StreamError::compression("zstd", e.to_string()))
            }
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Lz4 => write!(f, "lz4"),
            Self::Zstd { level } => write!(f, "zstd:{level}"),
        }
    }
}

impl FromStr for Compression {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, level) = match s.split_once(':') {
            Some((name, level)) => (name, Some(level)),
            None => (s, None),
        };

        match (name.to_lowercase().as_str(), level) {
            ("none", None) => Ok(Self::None),
            ("lz4", None) => Ok(Self::Lz4),
            ("zstd", None) => Ok(Self::Zstd {
                level: DEFAULT_ZSTD_LEVEL,
            }),
            ("zstd", Some(level)) => {
                let level: i32 = level.parse().map_err(|_| {
                    StreamError::config(format!("invalid zstd level '{level}'"))
                })?;
                if !zstd::compression_level_range().contains(&level) {
                    return Err(StreamError::config(format!(
                        "zstd level {level} is outside the supported range"
                    )));
                }
                Ok(Self::Zstd { level })
            }
            _ => Err(StreamError::config(format!(
                "unknown compression '{s}', expected one of: none, lz4, zstd[:level]"
            ))),
        }
    }
}

impl Serialize for Compression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Compression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert_eq!("lz4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert_eq!(
            "zstd".parse::<Compression>().unwrap(),
            Compression::Zstd { level: 3 }
        );
        assert_eq!(
            "zstd:9".parse::<Compression>().unwrap(),
            Compression::Zstd { level: 9 }
        );
        assert!("gzip".parse::<Compression>().is_err());
        assert!("lz4:2".parse::<Compression>().is_err());
        assert!("zstd:fast".parse::<Compression>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for c in [Compression::None, Compression::Lz4, Compression::Zstd { level: 5 }] {
            assert_eq!(c.to_string().parse::<Compression>().unwrap(), c);
        }
    }

    #[test]
    fn test_compress_roundtrip() {
        let data: Vec<u8> = b"one two three ".iter().copied().cycle().take(4096).collect();
        for c in [Compression::None, Compression::Lz4, Compression::Zstd { level: 3 }] {
            let packed = c.compress(&data).unwrap();
            if !c.is_none() {
                assert!(packed.len() < data.len());
            }
            assert_eq!(c.decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let garbage = vec![0xFFu8; 32];
        assert!(Compression::Zstd { level: 3 }.decompress(&garbage).is_err());
        assert!(Compression::Lz4.decompress(&garbage).is_err());
    }
}
