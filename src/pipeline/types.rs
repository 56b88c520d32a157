//! Shared types for the classification pipeline.

use serde::{Deserialize, Serialize};

use crate::pipeline::merchants::MatchedOn;

/// Category key used when nothing else applies.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Which stage produced a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClassificationSource {
    /// Ordered rule list.
    Rule,
    /// Pluggable fallback classifier above the confidence threshold.
    Model,
    /// Nothing matched; `uncategorized`.
    Default,
}

impl ClassificationSource {
    /// Tag stored alongside the classification.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::Rule => "RULE",
            ClassificationSource::Model => "MODEL",
            ClassificationSource::Default => "DEFAULT",
        }
    }
}

impl std::str::FromStr for ClassificationSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RULE" => Ok(ClassificationSource::Rule),
            "MODEL" => Ok(ClassificationSource::Model),
            "DEFAULT" => Ok(ClassificationSource::Default),
            other => Err(format!("Unknown classification source: '{other}'")),
        }
    }
}

impl std::fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the categorization stages, before the key is resolved to an id.
#[derive(Debug, Clone, PartialEq)]
pub struct Categorization {
    pub category_key: String,
    pub confidence: f64,
    pub source: ClassificationSource,
}

impl Categorization {
    pub fn uncategorized() -> Self {
        Self {
            category_key: UNCATEGORIZED.to_string(),
            confidence: 0.0,
            source: ClassificationSource::Default,
        }
    }
}

/// Merchant linked to a transaction, with the evidence for the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MerchantLink {
    pub merchant_id: i64,
    pub merchant_key: String,
    pub keyword: String,
    pub matched_on: MatchedOn,
}

/// Final outcome for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub transaction_id: i64,
    pub category_key: String,
    pub category_id: i64,
    pub confidence: f64,
    pub source: ClassificationSource,
    pub merchant: Option<MerchantLink>,
}
