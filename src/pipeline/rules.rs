//! Ordered rule classifier.
//!
//! Rules are evaluated top to bottom over the normalized description and the
//! first match wins. There is no scoring: lexically overlapping categories
//! (e.g. "wit software" as salary credit vs. software debit) are resolved
//! purely by list position, so the order of `default_rules` is part of the
//! contract.

use tracing::debug;

use crate::events::Direction;

/// Text test applied to a normalized description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Description contains the needle.
    Contains(String),
    /// Description contains at least one of the needles.
    ContainsAny(Vec<String>),
    /// Description starts with the prefix.
    StartsWith(String),
}

impl Pattern {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Pattern::Contains(needle) => text.contains(needle.as_str()),
            Pattern::ContainsAny(needles) => needles.iter().any(|n| text.contains(n.as_str())),
            Pattern::StartsWith(prefix) => text.starts_with(prefix.as_str()),
        }
    }
}

/// One `(predicate, category)` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: Pattern,
    /// When set, the rule only applies to transactions in this direction.
    pub direction: Option<Direction>,
    pub category: String,
}

impl Rule {
    pub fn contains(needle: &str, category: &str) -> Self {
        Self {
            pattern: Pattern::Contains(needle.into()),
            direction: None,
            category: category.into(),
        }
    }

    pub fn contains_any(needles: &[&str], category: &str) -> Self {
        Self {
            pattern: Pattern::ContainsAny(needles.iter().map(|n| n.to_string()).collect()),
            direction: None,
            category: category.into(),
        }
    }

    pub fn starts_with(prefix: &str, category: &str) -> Self {
        Self {
            pattern: Pattern::StartsWith(prefix.into()),
            direction: None,
            category: category.into(),
        }
    }

    /// Restrict the rule to credits.
    pub fn credit_only(mut self) -> Self {
        self.direction = Some(Direction::Credit);
        self
    }

    /// Restrict the rule to debits.
    pub fn debit_only(mut self) -> Self {
        self.direction = Some(Direction::Debit);
        self
    }

    fn matches(&self, text: &str, direction: Direction) -> bool {
        self.direction.is_none_or(|d| d == direction) && self.pattern.is_match(text)
    }
}

/// Prioritized rule list mapping descriptions to category keys.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    rules: Vec<Rule>,
}

impl RuleClassifier {
    /// The production rule set, in priority order.
    pub fn default_rules() -> Self {
        let rules = vec![
            Rule::contains_any(
                &["subsidio natal", "subsidio", "salario", "vencimento"],
                "salary",
            )
            .credit_only(),
            Rule::contains("wit software", "salary").credit_only(),
            Rule::contains_any(&["to flexible cash funds", "to robo portfolio"], "investments"),
            Rule::contains_any(&["apple pay top-up", "top-up"], "transfers_internal"),
            Rule::contains("sent from revolut", "transfers_external"),
            Rule::starts_with("cash at", "cash_withdrawal"),
            Rule::contains("uber", "transport"),
            Rule::contains("mcdonalds", "fast_food"),
            Rule::contains_any(&["tasca", "capicci"], "food_drink"),
            Rule::contains_any(
                &["apple.com/bill", "spotify", "amazon prime"],
                "subscriptions",
            ),
            Rule::contains("jetbrains", "software"),
            Rule::contains("wit software", "software").debit_only(),
            Rule::contains("playstation network", "entertainment"),
            Rule::contains_any(&["booking.com", "salamancayfiesta.com"], "travel"),
            Rule::contains_any(
                &["shein", "amazon.es", "klarna*pcdiga", "douglas", "moeve"],
                "shopping",
            ),
        ];

        Self { rules }
    }

    /// A classifier with no rules (for testing).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule at the lowest priority.
    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classify an already-normalized description.
    ///
    /// Returns the category key of the first matching rule, or `None`.
    pub fn classify(&self, normalized: &str, direction: Direction) -> Option<&str> {
        let (position, rule) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(normalized, direction))?;

        debug!(
            rule = position + 1,
            category = %rule.category,
            %direction,
            "Rule matched"
        );
        Some(rule.category.as_str())
    }

    /// Every category key this rule set can produce, first occurrence order.
    pub fn category_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for rule in &self.rules {
            if !keys.contains(&rule.category.as_str()) {
                keys.push(rule.category.as_str());
            }
        }
        keys
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::default_rules()
    }
}
