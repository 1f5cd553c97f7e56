//! Content normalization and SHA-256 digests.

use std::borrow::Cow;

use sha2::{Digest, Sha256};

/// Normalise line endings to LF.
pub fn normalize(content: &str) -> Cow<'_, str> {
    if content.contains("\r\n") {
        Cow::Owned(content.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(content)
    }
}

/// Lowercase hex SHA-256 of the normalised content.
pub fn content_hash(content: &str) -> String {
    let normalized = normalize(content);
    let mut h = Sha256::new();
    h.update(normalized.as_bytes());
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_and_lf_hash_identically() {
        assert_eq!(content_hash("a\r\nb\r\n"), content_hash("a\nb\n"));
    }

    #[test]
    fn known_digest_of_empty_string() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn lf_content_is_borrowed() {
        assert!(matches!(normalize("plain\n"), Cow::Borrowed(_)));
    }
}
