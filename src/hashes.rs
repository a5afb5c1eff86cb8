//! Content-hash helpers shared across the coalescer, manifest sync and
//! request router.
//!
//! A content hash is a hex string; its length implies the digest algorithm
//! (32 hex chars = MD5, 40 = SHA-1) — spec.md §4.3 step 3.

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Digest algorithm implied by a content hash's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
}

/// Resolve the digest algorithm for `hash`, or `None` if the length matches
/// neither known algorithm.
pub fn algorithm_for_hash(hash: &str) -> Option<DigestAlgorithm> {
    match hash.len() {
        32 => Some(DigestAlgorithm::Md5),
        40 => Some(DigestAlgorithm::Sha1),
        _ => None,
    }
}

/// `true` iff every character is an ASCII hex digit (and the string is
/// non-empty).
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Verify `data` against `hash` using the algorithm implied by its length.
/// Returns `false` (never an error) when the hash length is unrecognized —
/// callers treat that the same as a mismatch.
pub fn verify_digest(data: &[u8], hash: &str) -> bool {
    match algorithm_for_hash(hash) {
        Some(DigestAlgorithm::Md5) => {
            let digest = md5::Md5::digest(data);
            hex::encode(digest).eq_ignore_ascii_case(hash)
        }
        Some(DigestAlgorithm::Sha1) => {
            let digest = sha1::Sha1::digest(data);
            hex::encode(digest).eq_ignore_ascii_case(hash)
        }
        None => false,
    }
}

use md5::Digest as _;
use sha1::Digest as _;

/// MD5 and SHA-1 of the empty byte string: served as zero-length responses
/// without touching storage (spec.md §3).
pub static EMPTY_HASHES: Lazy<HashSet<String>> = Lazy::new(|| {
    let mut set = HashSet::with_capacity(2);
    set.insert(hex::encode(md5::Md5::digest(b"")));
    set.insert(hex::encode(sha1::Sha1::digest(b"")));
    set
});

/// `true` iff `hash` is one of the two well-known empty-file hashes.
pub fn is_empty_hash(hash: &str) -> bool {
    EMPTY_HASHES.contains(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hashes_are_well_known() {
        assert!(is_empty_hash("d41d8cd98f00b204e9800998ecf8427e"));
        assert!(is_empty_hash("da39a3ee5e6b4b0d3255bfef95601890afd80709"));
        assert!(!is_empty_hash("00000000000000000000000000000000"));
    }

    #[test]
    fn digest_algorithm_from_length() {
        assert_eq!(algorithm_for_hash(&"a".repeat(32)), Some(DigestAlgorithm::Md5));
        assert_eq!(algorithm_for_hash(&"a".repeat(40)), Some(DigestAlgorithm::Sha1));
        assert_eq!(algorithm_for_hash(&"a".repeat(10)), None);
    }

    #[test]
    fn verify_digest_matches_known_value() {
        let hash = hex::encode(md5::Md5::digest(b"hello"));
        assert!(verify_digest(b"hello", &hash));
        assert!(!verify_digest(b"world", &hash));
    }

    #[test]
    fn is_hex_rejects_non_hex() {
        assert!(is_hex("deadbeef"));
        assert!(!is_hex("deadbeefg"));
        assert!(!is_hex(""));
    }

    proptest::proptest! {
        /// spec.md §8, property 3: a digest computed over arbitrary bytes
        /// always verifies against itself and never against a
        /// single-byte-flipped corruption of the same length.
        #[test]
        fn digest_verifies_against_itself_and_rejects_corruption(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
            flip_index in 0usize..256,
        ) {
            let hash = hex::encode(md5::Md5::digest(&data));
            proptest::prop_assert!(verify_digest(&data, &hash));

            if !data.is_empty() {
                let mut corrupted = data.clone();
                let idx = flip_index % corrupted.len();
                corrupted[idx] ^= 0xFF;
                proptest::prop_assert!(!verify_digest(&corrupted, &hash));
            }
        }
    }
}
