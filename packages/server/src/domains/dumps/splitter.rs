//! Dump fragmenting for interpretation.
//!
//! P1 splits a dump body into atomic fragments using the blank-line rule:
//! newlines are normalized to LF, then the text splits on one or more
//! blank lines (whitespace-only lines count as blank). Leading and
//! trailing whitespace on each fragment is stripped; inner whitespace such
//! as list indentation is preserved.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref BLANK_LINE_RE: Regex = Regex::new(r"\r?\n\s*\r?\n+").unwrap();
}

/// Convert CRLF / CR / LFCR newline variants to LF only.
///
/// Step order matters: CRLF first, then lone CR.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace("\n\r", "\n").replace('\r', "\n")
}

/// Split a dump body into interpretation fragments.
pub fn split_dump(body: &str) -> Vec<String> {
    let clean = normalize_newlines(body);
    BLANK_LINE_RE
        .split(clean.trim())
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_two_fragments_across_newline_variants() {
        for raw in [
            "a\n\nb",       // LF
            "a\r\n\r\nb",   // CRLF
            "a\r\n\n b",    // mixed with space indent
            "a\n \n\nb",    // indented blank line
            "a\n\n\n b",    // triple blank
        ] {
            assert_eq!(split_dump(raw), vec!["a", "b"], "raw: {raw:?}");
        }
    }

    #[test]
    fn inner_whitespace_is_preserved() {
        let body = "plan:\n  - reduce MTTR\n  - fix paging\n\nnotes";
        let fragments = split_dump(body);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0], "plan:\n  - reduce MTTR\n  - fix paging");
    }

    #[test]
    fn normalizes_newline_variants_to_lf() {
        assert_eq!(normalize_newlines("a\r\nb\rc\n\rd"), "a\nb\nc\nd");
    }

    #[test]
    fn empty_body_yields_no_fragments() {
        assert!(split_dump("").is_empty());
        assert!(split_dump("\n\n\n").is_empty());
        assert!(split_dump("   \r\n \n ").is_empty());
    }
}
