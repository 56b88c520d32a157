//! Merchant matching by keyword substring scoring.
//!
//! Each merchant carries a keyword set derived from its key, name and
//! aliases. A description scores against a merchant as the length of the
//! longest keyword it contains; the best (merchant, field) pair over both
//! description fields wins.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;

use crate::pipeline::normalize::normalize_for_match;

/// Description field that produced a match.
///
/// Ordered so that `Display < Raw`: on a full tie the display field wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MatchedOn {
    #[serde(rename = "description_display")]
    Display,
    #[serde(rename = "description_raw")]
    Raw,
}

impl MatchedOn {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedOn::Display => "description_display",
            MatchedOn::Raw => "description_raw",
        }
    }
}

impl std::fmt::Display for MatchedOn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merchant with its precomputed keyword set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merchant {
    pub id: i64,
    pub key: String,
    pub name: String,
    keywords: BTreeSet<String>,
}

impl Merchant {
    /// Build a merchant, deriving keywords from key, name and aliases.
    pub fn new<S: AsRef<str>>(id: i64, key: &str, name: &str, aliases: &[S]) -> Self {
        let keywords = std::iter::once(key)
            .chain(std::iter::once(name))
            .chain(aliases.iter().map(|a| a.as_ref()))
            .map(normalize_for_match)
            .filter(|kw| !kw.is_empty())
            .collect();

        Self {
            id,
            key: key.to_string(),
            name: name.to_string(),
            keywords,
        }
    }

    /// Normalized, deduplicated, non-empty keywords in sorted order.
    pub fn keywords(&self) -> &BTreeSet<String> {
        &self.keywords
    }

    /// Longest keyword contained in `candidate`, with its length.
    ///
    /// Equal-length keywords resolve to the lexicographically smallest,
    /// since the set iterates in sorted order and only a strictly longer
    /// keyword replaces the current best.
    fn best_keyword(&self, candidate: &str) -> Option<(usize, &str)> {
        let mut best: Option<(usize, &str)> = None;
        for kw in &self.keywords {
            if !candidate.contains(kw.as_str()) {
                continue;
            }
            let score = kw.chars().count();
            if best.is_none_or(|(s, _)| score > s) {
                best = Some((score, kw.as_str()));
            }
        }
        best
    }
}

/// Winning merchant for a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantMatch<'a> {
    pub merchant: &'a Merchant,
    pub keyword: &'a str,
    pub matched_on: MatchedOn,
    /// Character length of `keyword`.
    pub score: usize,
}

impl MerchantMatch<'_> {
    /// Total order used to pick a winner: higher score first, then
    /// display before raw, then the lower merchant id.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.matched_on.cmp(&other.matched_on))
            .then_with(|| self.merchant.id.cmp(&other.merchant.id))
    }
}

/// Merchant catalog prepared for matching.
///
/// Built once per catalog load; cheap to query per transaction.
#[derive(Debug, Clone, Default)]
pub struct MerchantMatcher {
    merchants: Vec<Merchant>,
}

impl MerchantMatcher {
    pub fn new(mut merchants: Vec<Merchant>) -> Self {
        merchants.sort_by_key(|m| m.id);
        Self { merchants }
    }

    pub fn len(&self) -> usize {
        self.merchants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merchants.is_empty()
    }

    pub fn merchants(&self) -> &[Merchant] {
        &self.merchants
    }

    /// Find the best merchant for a transaction's descriptions.
    ///
    /// Both fields are scored against every merchant and the single best
    /// pair is returned, so a raw-field match overrides a display-field
    /// match only when its score is strictly higher. Within one field,
    /// equal scores go to the lower merchant id. A zero score never matches.
    pub fn find(
        &self,
        description_raw: Option<&str>,
        description_display: Option<&str>,
    ) -> Option<MerchantMatch<'_>> {
        let candidates = [
            (MatchedOn::Display, description_display),
            (MatchedOn::Raw, description_raw),
        ];

        let mut best: Option<MerchantMatch<'_>> = None;

        for (matched_on, text) in candidates {
            let normalized = normalize_for_match(text.unwrap_or_default());
            if normalized.is_empty() {
                continue;
            }

            for merchant in &self.merchants {
                let Some((score, keyword)) = merchant.best_keyword(&normalized) else {
                    continue;
                };
                let candidate = MerchantMatch {
                    merchant,
                    keyword,
                    matched_on,
                    score,
                };
                let replace = match &best {
                    None => true,
                    Some(current) => candidate.rank(current) == Ordering::Less,
                };
                if replace {
                    best = Some(candidate);
                }
            }
        }

        best
    }
}
