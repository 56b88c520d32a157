//! Text canonicalization for rule evaluation and merchant matching.
//!
//! Keep this logic single-sourced: rules and merchant keywords must see
//! descriptions through exactly the same lens.

use std::sync::LazyLock;

use regex::Regex;

static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex compiles"));

/// Canonical form used by the rule classifier.
///
/// Trims, transliterates to ASCII, collapses whitespace runs and lowercases.
/// Punctuation survives so rules can match tokens such as `apple.com/bill`.
pub fn normalize(text: &str) -> String {
    let ascii = deunicode::deunicode(text.trim());
    ascii
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical form used for merchant keyword matching.
///
/// Applies [`normalize`], then reduces everything outside `[a-z0-9]` to
/// single spaces. Output contains only `[a-z0-9 ]` with no leading,
/// trailing or doubled spaces.
pub fn normalize_for_match(text: &str) -> String {
    let normalized = normalize(text);
    let spaced = NON_ALNUM.replace_all(&normalized, " ");
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}
