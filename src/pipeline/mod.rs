//! Transaction categorization pipeline.
//!
//! Every transaction event flows through:
//! 1. `normalize()`: fold case, whitespace and diacritics
//! 2. `RuleClassifier::classify()`: ordered keyword rules
//! 3. optional `FallbackClassifier`: consulted only when no rule matches
//! 4. `MerchantMatcher::find()`: longest-keyword merchant link
//!
//! `Consumer` drives this per event with at-least-once delivery;
//! `reconcile_merchants` re-runs step 4 in bulk over stored transactions.

pub mod categorizer;
pub mod consumer;
pub mod fallback;
pub mod merchants;
pub mod normalize;
pub mod reconcile;
pub mod rules;
pub mod types;
