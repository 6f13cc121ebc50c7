//! Value codec: serialization, gzip compression and checksums.
//!
//! Values are serialized to JSON bytes. The checksum always covers those
//! uncompressed bytes so corruption is detected after decompression too.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::CacheEntry;
use crate::error::CacheError;

/// A serialized value ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedValue {
    /// Stored bytes (gzip stream when `compressed`)
    pub bytes: Vec<u8>,
    pub compressed: bool,
    /// SHA-256 hex digest of the uncompressed serialized bytes
    pub checksum: String,
    /// Length of the uncompressed serialized bytes
    pub raw_len: usize,
}

/// Decides whether a serialized payload of `serialized_len` bytes is compressed.
pub fn should_compress(serialized_len: usize, threshold: usize, force: bool) -> bool {
    force || serialized_len >= threshold
}

/// Lower-case hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

// == Encode ==
/// Serializes `value`, compressing it when [`should_compress`] says so.
pub fn encode<T: Serialize + ?Sized>(
    value: &T,
    threshold: usize,
    force_compression: bool,
) -> Result<EncodedValue, CacheError> {
    let raw = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
    let checksum = checksum(&raw);
    let raw_len = raw.len();

    if should_compress(raw_len, threshold, force_compression) {
        let bytes = compress(&raw).map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(EncodedValue {
            bytes,
            compressed: true,
            checksum,
            raw_len,
        })
    } else {
        Ok(EncodedValue {
            bytes: raw,
            compressed: false,
            checksum,
            raw_len,
        })
    }
}

// == Decode ==
/// Recovers the uncompressed serialized bytes of an entry and verifies them
/// against the stored checksum.
pub fn decode_entry(entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
    let raw = if entry.compressed {
        decompress(&entry.data).map_err(|e| CacheError::Serialization(format!(
            "failed to decompress {}: {e}",
            entry.key
        )))?
    } else {
        entry.data.clone()
    };

    let actual = checksum(&raw);
    if actual != entry.checksum {
        return Err(CacheError::ChecksumMismatch {
            key: entry.key.clone(),
            expected: entry.checksum.clone(),
            actual,
        });
    }
    Ok(raw)
}

/// Deserializes verified bytes into the caller's type.
pub fn deserialize<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(raw).map_err(|e| CacheError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_should_compress_threshold() {
        assert!(!should_compress(1023, 1024, false));
        assert!(should_compress(1024, 1024, false));
        assert!(should_compress(4096, 1024, false));
        assert!(should_compress(1, 1024, true));
        assert!(should_compress(0, 0, false));
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let sum = checksum(b"abc");
        assert_eq!(
            sum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_encode_small_value_uncompressed() {
        let encoded = encode(&json!({"rule": "sql_injection"}), 1024, false).unwrap();
        assert!(!encoded.compressed);
        assert_eq!(encoded.bytes.len(), encoded.raw_len);
        assert_eq!(encoded.checksum, checksum(&encoded.bytes));
    }

    #[test]
    fn test_encode_large_value_compressed() {
        let source = "<?php echo 'x'; ".repeat(200);
        let encoded = encode(&source, 1024, false).unwrap();
        assert!(encoded.compressed);
        assert!(encoded.bytes.len() < encoded.raw_len);
    }

    #[test]
    fn test_forced_compression_roundtrip() {
        let encoded = encode(&"tiny", 1024, true).unwrap();
        assert!(encoded.compressed);

        let entry = CacheEntry::new("k", encoded, Duration::from_secs(1));
        let raw = decode_entry(&entry).unwrap();
        let value: String = deserialize(&raw).unwrap();
        assert_eq!(value, "tiny");
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let encoded = encode(&"hello world", 1024, false).unwrap();
        let mut entry = CacheEntry::new("k", encoded, Duration::from_secs(1));
        entry.data[3] ^= 0x20;

        let err = decode_entry(&entry).unwrap_err();
        assert!(matches!(err, CacheError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_corrupt_gzip_stream_is_error() {
        let encoded = encode(&"hello".repeat(500), 16, false).unwrap();
        let mut entry = CacheEntry::new("k", encoded, Duration::from_secs(1));
        let len = entry.data.len();
        entry.data.truncate(len / 2);

        assert!(decode_entry(&entry).is_err());
    }
}
