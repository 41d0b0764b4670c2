//! # Cache Value Serializer
//!
//! Turns values into the byte payload stored in cache entries and back.
//! The wire layout is a single flag byte followed by the encoded value:
//!
//! ```text
//! +------+---------------------------------------------+
//! | flag | payload (JSON or bincode, zlib if flag = 1) |
//! +------+---------------------------------------------+
//! ```
//!
//! The encoding format is fixed by configuration, never sniffed per value.

use super::{CacheError, CacheResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use tracing::{debug, warn};

/// Payload stored as-is
pub const FLAG_PLAIN: u8 = 0;

/// Payload is zlib-compressed
pub const FLAG_COMPRESSED: u8 = 1;

/// Encoding used for cached values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    /// serde_json; works with any serde type including `serde_json::Value`
    #[default]
    Json,
    /// bincode; compact, but requires concrete (non self-describing) types
    Binary,
}

impl SerializationFormat {
    /// Suffix appended to namespaced keys so entries written in different
    /// formats never collide
    pub fn key_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Json => None,
            Self::Binary => Some("bin"),
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for SerializationFormat {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "binary" | "bincode" => Ok(Self::Binary),
            other => Err(CacheError::Configuration {
                message: format!("unknown serialization format '{}'", other),
            }),
        }
    }
}

/// Serializer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    /// Encoding format
    pub format: SerializationFormat,

    /// Compress payloads larger than `compression_threshold`
    pub compression_enabled: bool,

    /// Size in bytes above which encoded payloads are compressed
    pub compression_threshold: usize,

    /// zlib level, 0-9
    pub compression_level: u32,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            format: SerializationFormat::Json,
            compression_enabled: true,
            compression_threshold: 1024,
            compression_level: 6,
        }
    }
}

/// Stateless value codec
#[derive(Debug, Clone)]
pub struct Serializer {
    config: SerializerConfig,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(SerializerConfig::default())
    }
}

impl Serializer {
    pub fn new(config: SerializerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SerializerConfig {
        &self.config
    }

    pub fn format(&self) -> SerializationFormat {
        self.config.format
    }

    /// Encode a value, compressing it when it exceeds the threshold
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        let encoded = match self.config.format {
            SerializationFormat::Json => serde_json::to_vec(value)?,
            SerializationFormat::Binary => bincode::serialize(value)?,
        };

        if self.config.compression_enabled && encoded.len() > self.config.compression_threshold {
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(encoded.len() / 2 + 1),
                Compression::new(self.config.compression_level.min(9)),
            );
            encoder.write_all(&encoded)?;
            let compressed = encoder.finish()?;

            debug!(
                original = encoded.len(),
                compressed = compressed.len(),
                "Compressed cache payload"
            );

            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(FLAG_COMPRESSED);
            out.extend_from_slice(&compressed);
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(encoded.len() + 1);
            out.push(FLAG_PLAIN);
            out.extend_from_slice(&encoded);
            Ok(out)
        }
    }

    /// Decode a payload, surfacing the failure reason
    pub fn try_deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        let (flag, payload) = bytes.split_first().ok_or_else(|| CacheError::Serialization {
            message: "empty payload".to_string(),
        })?;

        let decoded;
        let body: &[u8] = match *flag {
            FLAG_PLAIN => payload,
            FLAG_COMPRESSED => {
                let mut buf = Vec::with_capacity(payload.len() * 2);
                ZlibDecoder::new(payload).read_to_end(&mut buf)?;
                decoded = buf;
                &decoded
            }
            other => {
                return Err(CacheError::Serialization {
                    message: format!("unknown payload flag {}", other),
                })
            }
        };

        match self.config.format {
            SerializationFormat::Json => Ok(serde_json::from_slice(body)?),
            SerializationFormat::Binary => Ok(bincode::deserialize(body)?),
        }
    }

    /// Decode a payload; malformed input is logged and yields `None`
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Option<T> {
        match self.try_deserialize(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "Discarding undecodable cache payload");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct LessonPlan {
        title: String,
        minutes: u32,
        objectives: Vec<String>,
    }

    fn payload_of_size(len: usize) -> serde_json::Value {
        // `"` + body + `"` is the encoded size
        json!("x".repeat(len.saturating_sub(2)))
    }

    #[test]
    fn test_small_payload_is_not_compressed() {
        let serializer = Serializer::default();
        let value = json!({"class": "7B", "scores": [81, 92, 77], "meta": {"term": 2}});

        let bytes = serializer.serialize(&value).unwrap();
        assert_eq!(bytes[0], FLAG_PLAIN);
        assert_eq!(serializer.deserialize::<serde_json::Value>(&bytes), Some(value));
    }

    #[test]
    fn test_threshold_boundary() {
        let serializer = Serializer::default();

        let at_threshold = payload_of_size(1024);
        let bytes = serializer.serialize(&at_threshold).unwrap();
        assert_eq!(bytes[0], FLAG_PLAIN);
        assert_eq!(serializer.deserialize::<serde_json::Value>(&bytes), Some(at_threshold));

        let above = payload_of_size(1025);
        let bytes = serializer.serialize(&above).unwrap();
        assert_eq!(bytes[0], FLAG_COMPRESSED);
        assert!(bytes.len() < 1025);
        assert_eq!(serializer.deserialize::<serde_json::Value>(&bytes), Some(above));
    }

    #[test]
    fn test_compression_disabled() {
        let serializer = Serializer::new(SerializerConfig {
            compression_enabled: false,
            ..Default::default()
        });
        let bytes = serializer.serialize(&payload_of_size(4096)).unwrap();
        assert_eq!(bytes[0], FLAG_PLAIN);
    }

    #[test]
    fn test_binary_format_round_trip() {
        let serializer = Serializer::new(SerializerConfig {
            format: SerializationFormat::Binary,
            compression_threshold: 16,
            ..Default::default()
        });
        let plan = LessonPlan {
            title: "Fractions".into(),
            minutes: 45,
            objectives: vec!["compare".into(), "add".into(), "simplify".into()],
        };

        let bytes = serializer.serialize(&plan).unwrap();
        assert_eq!(bytes[0], FLAG_COMPRESSED);
        assert_eq!(serializer.deserialize::<LessonPlan>(&bytes), Some(plan));
    }

    #[test]
    fn test_malformed_payloads_yield_none() {
        let serializer = Serializer::default();

        assert_eq!(serializer.deserialize::<serde_json::Value>(&[]), None);
        assert_eq!(serializer.deserialize::<serde_json::Value>(&[7, b'1']), None);
        assert_eq!(
            serializer.deserialize::<serde_json::Value>(&[FLAG_COMPRESSED, 1, 2, 3, 4]),
            None
        );
        assert_eq!(
            serializer.deserialize::<serde_json::Value>(&[FLAG_PLAIN, b'{', b'x']),
            None
        );
        assert!(matches!(
            serializer.try_deserialize::<serde_json::Value>(&[9]),
            Err(CacheError::Serialization { .. })
        ));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<SerializationFormat>().unwrap(), SerializationFormat::Json);
        assert_eq!("bincode".parse::<SerializationFormat>().unwrap(), SerializationFormat::Binary);
        assert!("pickle".parse::<SerializationFormat>().is_err());
        assert_eq!(SerializationFormat::Binary.key_suffix(), Some("bin"));
    }
}
