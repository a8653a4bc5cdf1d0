//! Value serialization and opportunistic compression.
//!
//! Serialization and compression are independent, composable steps: the
//! codec turns values into bytes, and [`maybe_compress`] decides whether the
//! encoded form is worth compressing. Tiers store whichever form wins and
//! record a `compressed` flag alongside the payload.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("deserialization failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("decompression failed: {0}")]
    Decompress(#[from] std::io::Error),
}

/// Pluggable value codec. The engine stores only bytes; callers pick the
/// serialization format by supplying a codec at construction.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value into its serialized byte form.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Decode a value from its serialized byte form.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Default codec: JSON via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

/// Compress the payload when it is large enough and compression actually
/// pays off. Returns the bytes to store and whether they are compressed.
///
/// Values below `threshold_bytes` are stored raw. Above it, the compressed
/// form is kept only when it is at least `min_gain` smaller than the input;
/// incompressible data is stored raw rather than paying decompression cost
/// for nothing.
pub fn maybe_compress(data: &[u8], config: &CompressionConfig) -> (Bytes, bool) {
    if data.len() < config.threshold_bytes {
        return (Bytes::copy_from_slice(data), false);
    }

    match zstd::encode_all(data, config.zstd_level) {
        Ok(compressed) => {
            let max_kept = (data.len() as f64 * (1.0 - config.min_gain)) as usize;
            if compressed.len() <= max_kept {
                (Bytes::from(compressed), true)
            } else {
                (Bytes::copy_from_slice(data), false)
            }
        }
        Err(e) => {
            tracing::warn!(size = data.len(), error = %e, "Compression failed, storing raw");
            (Bytes::copy_from_slice(data), false)
        }
    }
}

/// Reverse of [`maybe_compress`] for payloads with a known `compressed` flag.
pub fn decompress(data: &[u8]) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(zstd::decode_all(data)?))
}

/// Decode a payload whose compression state is unknown (the distributed
/// tier stores no flag): try decompression first, fall back to raw bytes.
pub fn decode_payload(data: &[u8]) -> Bytes {
    match zstd::decode_all(data) {
        Ok(decompressed) => Bytes::from(decompressed),
        Err(_) => Bytes::copy_from_slice(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// splitmix64 output: high-entropy bytes that zstd cannot shrink.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x243F_6A88_85A3_08D3u64;
        let mut out = Vec::with_capacity(len + 8);
        while out.len() < len {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            out.extend_from_slice(&(z ^ (z >> 31)).to_le_bytes());
        }
        out.truncate(len);
        out
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let value = serde_json::json!({"name": "A", "score": 42});
        let encoded = codec.encode(&value).unwrap();
        let decoded: serde_json::Value = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_small_values_stored_raw() {
        let config = CompressionConfig::default();
        let data = vec![7u8; 128];
        let (stored, compressed) = maybe_compress(&data, &config);
        assert!(!compressed);
        assert_eq!(&stored[..], &data[..]);
    }

    #[test]
    fn test_compressible_value_shrinks() {
        let config = CompressionConfig::default();
        let data = vec![42u8; 16 * 1024];
        let (stored, compressed) = maybe_compress(&data, &config);
        assert!(compressed);
        assert!(stored.len() < data.len());

        let restored = decompress(&stored).unwrap();
        assert_eq!(&restored[..], &data[..]);
    }

    #[test]
    fn test_incompressible_value_stored_raw() {
        let config = CompressionConfig::default();
        let data = noise(16 * 1024);
        let (stored, compressed) = maybe_compress(&data, &config);
        assert!(!compressed);
        assert_eq!(stored.len(), data.len());
    }

    #[test]
    fn test_decode_payload_handles_both_forms() {
        let config = CompressionConfig {
            threshold_bytes: 1,
            ..CompressionConfig::default()
        };
        let data = vec![9u8; 8 * 1024];

        let (stored, compressed) = maybe_compress(&data, &config);
        assert!(compressed);
        assert_eq!(&decode_payload(&stored)[..], &data[..]);

        let raw = b"plain payload";
        assert_eq!(&decode_payload(raw)[..], raw);
    }
}
