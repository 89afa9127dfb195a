//! Content checksums for notice deduplication.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a notice payload. Two submissions of the same bytes for
/// the same event share a checksum and are stored once.
pub fn notice_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_hex() {
        let xml = "<voe:VOEvent ivorn=\"ivo://nasa.gsfc.gcn/Fermi#GBM_Gnd_Pos\"/>";
        let a = notice_checksum(xml);
        assert_eq!(a, notice_checksum(xml));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_whitespace_changes_checksum() {
        assert_ne!(notice_checksum("<a/>"), notice_checksum("<a />"));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            notice_checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
