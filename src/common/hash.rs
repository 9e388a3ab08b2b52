//! Hashing utilities for needlefs
//!
//! BLAKE3 digests guard erasure-coded shards while they move between servers.

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Check `data` against an expected hex digest.
pub fn verify_blake3(data: &[u8], expected: &str) -> crate::Result<()> {
    let actual = blake3_hash(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(crate::Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_hash() {
        let hash1 = blake3_hash(b"hello world");
        let hash2 = blake3_hash(b"hello world");
        let hash3 = blake3_hash(b"hello world!");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_verify_blake3() {
        let digest = blake3_hash(b"shard");
        assert!(verify_blake3(b"shard", &digest).is_ok());
        assert!(verify_blake3(b"shard", &digest.to_uppercase()).is_ok());
        assert!(matches!(
            verify_blake3(b"other", &digest),
            Err(crate::Error::ChecksumMismatch { .. })
        ));
    }
}
