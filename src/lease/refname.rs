//! Parsing of GitHub merge-queue temporary refs.
//!
//! The host queue names its temporary branches
//! `gh-readonly-queue/<baseRef>/pr-<number>-<hex sha>`, e.g.
//! `gh-readonly-queue/develop/pr-31132-d107b89c095dd85ba6c62b8a4503100ee33a04bb`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^gh-readonly-queue/([^/]+)/pr-(\d+)-([0-9a-fA-F]+)$")
        .expect("ref regex is valid")
});

/// A head ref that does not follow the merge-queue grammar.
///
/// Refs are validated at the transport layer, so hitting this while building
/// a winner's context means a misbehaving client (or corrupted state) and is
/// surfaced as an internal failure rather than silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefFormatError {
    pub head_ref: String,
}

impl fmt::Display for RefFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not extract PR number from ref: invalid ref format (given: `{}`)",
            self.head_ref
        )
    }
}

impl std::error::Error for RefFormatError {}

/// Whether `head_ref` follows the merge-queue temporary ref grammar.
pub fn valid_gh_temp_ref(head_ref: &str) -> bool {
    REF_REGEX.is_match(head_ref)
}

/// Extracts the pull request number from a merge-queue temporary ref.
pub fn parse_pr_number(head_ref: &str) -> Result<u64, RefFormatError> {
    let captures = match REF_REGEX.captures(head_ref) {
        Some(captures) => captures,
        None => {
            return Err(RefFormatError {
                head_ref: head_ref.to_string(),
            })
        }
    };

    captures[2].parse::<u64>().map_err(|_| RefFormatError {
        head_ref: head_ref.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pr_number_from_valid_ref() {
        let number = parse_pr_number(
            "gh-readonly-queue/develop/pr-31132-d107b89c095dd85ba6c62b8a4503100ee33a04bb",
        )
        .unwrap();
        assert_eq!(number, 31132);
    }

    #[test]
    fn parses_single_digit_pr_number() {
        assert_eq!(parse_pr_number("gh-readonly-queue/main/pr-1-ab12").unwrap(), 1);
    }

    #[test]
    fn rejects_malformed_refs() {
        for bad in [
            "",
            "refs/heads/main",
            "gh-readonly-queue/main",
            "gh-readonly-queue/main/pr--abc",
            "gh-readonly-queue/main/pr-12",
            "gh-readonly-queue/main/pr-12-zz99xx", // non-hex suffix
            "gh-readonly-queue/a/b/pr-12-abc",     // extra path segment
            "prefix-gh-readonly-queue/main/pr-12-abc",
        ] {
            assert!(parse_pr_number(bad).is_err(), "expected rejection: {bad}");
            assert!(!valid_gh_temp_ref(bad), "expected invalid: {bad}");
        }
    }

    #[test]
    fn validation_accepts_what_parsing_accepts() {
        let valid = "gh-readonly-queue/release-1.2/pr-42-0badc0de";
        assert!(valid_gh_temp_ref(valid));
        assert_eq!(parse_pr_number(valid).unwrap(), 42);
    }
}
