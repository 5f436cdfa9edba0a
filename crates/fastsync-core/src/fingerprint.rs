//! Content fingerprints.
//!
//! A 32-bit rolling hash (`h = h * 31 + unit`, wrapping at `i32`) rendered as a decimal
//! string. The server compares these values verbatim, so text is hashed over UTF-16 code
//! units and binary content over raw bytes. For ASCII text both agree.

/// Fingerprint raw bytes (attachments, config files, reassembled downloads).
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let hash = bytes
        .iter()
        .fold(0i32, |h, &b| h.wrapping_mul(31).wrapping_add(i32::from(b)));
    hash.to_string()
}

/// Fingerprint text content or a path string.
pub fn fingerprint_text(text: &str) -> String {
    let hash = text
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    hash.to_string()
}

/// Stable identifier for a path, independent of its content.
pub fn path_hash(path: &str) -> String {
    fingerprint_text(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_hashes_to_zero() {
        assert_eq!(fingerprint_bytes(b""), "0");
        assert_eq!(fingerprint_text(""), "0");
    }

    #[test]
    fn test_known_values() {
        // 'a' = 97
        assert_eq!(fingerprint_text("a"), "97");
        // 97 * 31 + 98
        assert_eq!(fingerprint_text("ab"), "3105");
        assert_eq!(fingerprint_text("hello"), "99162322");
    }

    #[test]
    fn test_wraps_at_i32() {
        let long = "z".repeat(64);
        let value: i64 = fingerprint_text(&long).parse().unwrap();
        assert!(value >= i64::from(i32::MIN) && value <= i64::from(i32::MAX));
    }

    #[test]
    fn test_text_and_bytes_agree_for_ascii() {
        let text = "# Title\nsome body text";
        assert_eq!(fingerprint_text(text), fingerprint_bytes(text.as_bytes()));
    }

    #[test]
    fn test_deterministic() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        assert_eq!(fingerprint_bytes(&data), fingerprint_bytes(&data));
        assert_eq!(path_hash("notes/a.md"), path_hash("notes/a.md"));
        assert_ne!(path_hash("notes/a.md"), path_hash("notes/b.md"));
    }
}
