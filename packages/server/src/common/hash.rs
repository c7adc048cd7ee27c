//! Content hashing for embedding reuse and reflection windows.
//!
//! Hashes are computed over normalized text (lowercased, punctuation
//! stripped, whitespace collapsed) so trivially reformatted content maps to
//! the same digest.

use sha2::{Digest, Sha256};

/// Returns the hex sha256 of the normalized input.
pub fn content_hash(text: &str) -> String {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let collapsed = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut hasher = Sha256::new();
    hasher.update(collapsed.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_produces_same_hash() {
        assert_eq!(
            content_hash("Reduce MTTR below 10 minutes"),
            content_hash("Reduce MTTR below 10 minutes")
        );
    }

    #[test]
    fn case_and_punctuation_are_ignored() {
        assert_eq!(
            content_hash("Reduce MTTR below 10 minutes!"),
            content_hash("reduce mttr below 10 minutes")
        );
    }

    #[test]
    fn whitespace_is_normalized() {
        assert_eq!(
            content_hash("  Reduce   MTTR  below 10 minutes "),
            content_hash("Reduce MTTR below 10 minutes")
        );
    }

    #[test]
    fn different_content_differs() {
        assert_ne!(
            content_hash("Reduce MTTR below 10 minutes"),
            content_hash("Raise MTTR above 10 minutes")
        );
    }
}
