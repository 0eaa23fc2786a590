//! Identity derivation for library entities.
//!
//! `identifier_for` is the only key used to name files in the cover cache. It is
//! derived from an album's path when one is known, otherwise from its name;
//! names collide ("Greatest Hits") so the name fallback is a known degradation.
//!
//! `djb2` is a cheap value hash for in-memory containers and must never be used
//! to name anything on disk.

use sha2::{Digest, Sha256};

/// Returns the lowercase hex SHA-256 digest of the UTF-8 bytes of `path_or_name`.
pub fn identifier_for(path_or_name: &str) -> String {
    format!("{:x}", Sha256::digest(path_or_name.as_bytes()))
}

/// 32-bit djb2 hash (seed 5381, `h = h * 33 + byte`) over UTF-8 bytes.
pub fn djb2(value: &str) -> u32 {
    value.bytes().fold(5381u32, |hash, byte| {
        hash.wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(u32::from(byte))
    })
}

#[cfg(test)]
mod tests {
    use super::{djb2, identifier_for};

    #[test]
    fn test_identifier_matches_known_sha256_vectors() {
        assert_eq!(
            identifier_for(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            identifier_for("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_identifier_is_stable_and_distinct() {
        let first = identifier_for("Pink Floyd/The Wall");
        assert_eq!(first, identifier_for("Pink Floyd/The Wall"));
        assert_ne!(first, identifier_for("Pink Floyd/The Wall "));
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_djb2_reference_values() {
        assert_eq!(djb2(""), 5381);
        assert_eq!(djb2("a"), 5381 * 33 + 97);
        assert_eq!(djb2("ab"), (5381 * 33 + 97) * 33 + 98);
    }

    #[test]
    fn test_djb2_wraps_instead_of_overflowing() {
        let long = "x".repeat(4096);
        assert_eq!(djb2(&long), djb2(&long));
    }
}
