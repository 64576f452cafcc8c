//! Content digest used for every integrity check.

/// Hex-encoded MD5 of `bytes`.
///
/// The same function is used before and after a copy, so the two values are
/// directly comparable.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_fixed_length_lowercase_hex() {
        let digest = content_digest(b"");
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(content_digest(b"some payload").len(), 32);
        assert!(digest.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
    }

    #[test]
    fn digest_detects_single_byte_change() {
        assert_ne!(content_digest(b"abcdef"), content_digest(b"abcdeg"));
    }
}
