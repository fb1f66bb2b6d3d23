//! Reference extraction from free-form GitHub text
//!
//! Recovers closing references (`Fixes #12`, `closes acme/widget#7`) and
//! EVM payment addresses from PR bodies and comments. Everything here is
//! pure: no I/O, no logging.

use lazy_static::lazy_static;
use regex::Regex;
use sha3::{Digest, Keccak256};

use crate::model::ExtractedReference;

lazy_static! {
    /// GitHub closing keywords followed by `#N` or `owner/repo#N`.
    static ref CLOSING_REFERENCE: Regex = Regex::new(
        r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\b:?\s*(?:([A-Za-z0-9][A-Za-z0-9-]*/[A-Za-z0-9_.-]+))?#(\d+)\b"
    )
    .expect("closing reference regex compiles");

    static ref EVM_ADDRESS: Regex =
        Regex::new(r"\b0x[0-9a-fA-F]{40}\b").expect("address regex compiles");
}

/// Every closing reference in `text`, in order of appearance.
///
/// A bare `#N` resolves to `current_repo` (`owner/name`). Text without any
/// keyword/reference pair yields an empty vector.
pub fn extract_issue_references(text: &str, current_repo: &str) -> Vec<ExtractedReference> {
    CLOSING_REFERENCE
        .captures_iter(text)
        .filter_map(|caps| {
            let issue = caps.get(2)?.as_str().parse::<u64>().ok()?;
            let repo = caps
                .get(1)
                .map(|m| m.as_str().trim_end_matches('.').to_string())
                .unwrap_or_else(|| current_repo.to_string());
            Some(ExtractedReference {
                issue,
                repo,
                raw: caps.get(0)?.as_str().to_string(),
            })
        })
        .collect()
}

/// First `0x` + 40 hex character candidate in `text`.
///
/// Shape only; use [`is_valid_address`] before trusting the value.
pub fn extract_address(text: &str) -> Option<String> {
    EVM_ADDRESS.find(text).map(|m| m.as_str().to_string())
}

/// Standard EVM address validity: all-lowercase and all-uppercase hex are
/// accepted as is, mixed case must carry a correct EIP-55 checksum.
pub fn is_valid_address(candidate: &str) -> bool {
    let Some(digits) = candidate.strip_prefix("0x") else {
        return false;
    };
    if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }

    let lower = digits.to_ascii_lowercase();
    if digits == lower || digits == digits.to_ascii_uppercase() {
        return true;
    }

    let hash = hex::encode(Keccak256::digest(lower.as_bytes()));
    digits.chars().zip(hash.chars()).all(|(c, h)| {
        if c.is_ascii_digit() {
            return true;
        }
        match h.to_digit(16) {
            Some(nibble) if nibble >= 8 => c.is_ascii_uppercase(),
            Some(_) => c.is_ascii_lowercase(),
            None => false,
        }
    })
}

/// The first address candidate in `text`, if it is also a valid address.
///
/// A candidate failing validation counts as no address at all.
pub fn extract_valid_address(text: &str) -> Option<String> {
    extract_address(text).filter(|candidate| is_valid_address(candidate))
}
