//! Rules first, optional fallback second, `uncategorized` last.

use std::sync::Arc;

use tracing::debug;

use crate::error::ClassifierError;
use crate::events::Direction;
use crate::pipeline::fallback::FallbackClassifier;
use crate::pipeline::normalize::normalize;
use crate::pipeline::rules::RuleClassifier;
use crate::pipeline::types::{Categorization, ClassificationSource, UNCATEGORIZED};

/// Default confidence recorded for rule matches.
pub const DEFAULT_RULE_CONFIDENCE: f64 = 0.9;

/// Default minimum confidence for fallback predictions.
pub const DEFAULT_FALLBACK_THRESHOLD: f64 = 0.6;

pub struct Categorizer {
    rules: RuleClassifier,
    fallback: Option<Arc<dyn FallbackClassifier>>,
    rule_confidence: f64,
    fallback_threshold: f64,
}

impl Categorizer {
    pub fn new(rules: RuleClassifier) -> Self {
        Self {
            rules,
            fallback: None,
            rule_confidence: DEFAULT_RULE_CONFIDENCE,
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
        }
    }

    /// Install a secondary classifier gated by `threshold`.
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackClassifier>, threshold: f64) -> Self {
        self.fallback = Some(fallback);
        self.fallback_threshold = threshold;
        self
    }

    /// Change the acceptance threshold without touching the fallback.
    pub fn with_fallback_threshold(mut self, threshold: f64) -> Self {
        self.fallback_threshold = threshold;
        self
    }

    pub fn fallback_threshold(&self) -> f64 {
        self.fallback_threshold
    }

    pub fn with_rule_confidence(mut self, confidence: f64) -> Self {
        self.rule_confidence = confidence;
        self
    }

    pub fn rules(&self) -> &RuleClassifier {
        &self.rules
    }

    /// Every key this categorizer may emit, including `uncategorized`.
    ///
    /// Fallback output is open-ended and therefore not listed.
    pub fn known_category_keys(&self) -> Vec<&str> {
        let mut keys = self.rules.category_keys();
        if !keys.contains(&UNCATEGORIZED) {
            keys.push(UNCATEGORIZED);
        }
        keys
    }

    /// Categorize a raw (not yet normalized) description.
    pub async fn categorize(
        &self,
        description: Option<&str>,
        direction: Direction,
    ) -> Result<Categorization, ClassifierError> {
        let normalized = normalize(description.unwrap_or_default());
        if normalized.is_empty() {
            return Ok(Categorization::uncategorized());
        }

        if let Some(key) = self.rules.classify(&normalized, direction) {
            return Ok(Categorization {
                category_key: key.to_string(),
                confidence: self.rule_confidence,
                source: ClassificationSource::Rule,
            });
        }

        let Some(fallback) = &self.fallback else {
            return Ok(Categorization::uncategorized());
        };

        let prediction = fallback.predict(&normalized, direction).await?;
        if prediction.confidence >= self.fallback_threshold {
            Ok(Categorization {
                category_key: prediction.category_key,
                confidence: prediction.confidence,
                source: ClassificationSource::Model,
            })
        } else {
            debug!(
                classifier = fallback.name(),
                category = %prediction.category_key,
                confidence = prediction.confidence,
                threshold = self.fallback_threshold,
                "Fallback prediction below threshold"
            );
            Ok(Categorization::uncategorized())
        }
    }
}

impl Default for Categorizer {
    fn default() -> Self {
        Self::new(RuleClassifier::default_rules())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::fallback::Prediction;

    struct FixedPredictor {
        key: &'static str,
        confidence: f64,
        calls: AtomicUsize,
    }

    impl FixedPredictor {
        fn new(key: &'static str, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                key,
                confidence,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FallbackClassifier for FixedPredictor {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn predict(
            &self,
            _normalized: &str,
            _direction: Direction,
        ) -> Result<Prediction, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Prediction {
                category_key: self.key.to_string(),
                confidence: self.confidence,
            })
        }
    }

    struct BrokenPredictor;

    #[async_trait]
    impl FallbackClassifier for BrokenPredictor {
        fn name(&self) -> &str {
            "broken"
        }

        async fn predict(
            &self,
            _normalized: &str,
            _direction: Direction,
        ) -> Result<Prediction, ClassifierError> {
            Err(ClassifierError::Fallback {
                name: "broken".into(),
                reason: "model unavailable".into(),
            })
        }
    }

    #[tokio::test]
    async fn rule_match_uses_rule_confidence() {
        let categorizer = Categorizer::default().with_rule_confidence(0.75);
        let result = categorizer
            .categorize(Some("UBER *TRIP"), Direction::Debit)
            .await
            .unwrap();
        assert_eq!(result.category_key, "transport");
        assert_eq!(result.source, ClassificationSource::Rule);
        assert_eq!(result.confidence, 0.75);
    }

    #[tokio::test]
    async fn unknown_description_is_uncategorized() {
        let result = Categorizer::default()
            .categorize(Some("XYZ123 PURCHASE"), Direction::Debit)
            .await
            .unwrap();
        assert_eq!(result, Categorization::uncategorized());
    }

    #[tokio::test]
    async fn missing_description_is_uncategorized() {
        let predictor = FixedPredictor::new("groceries", 0.99);
        let categorizer = Categorizer::default().with_fallback(predictor.clone(), 0.6);
        let result = categorizer.categorize(None, Direction::Debit).await.unwrap();
        assert_eq!(result.category_key, UNCATEGORIZED);
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_not_consulted_when_rules_match() {
        let predictor = FixedPredictor::new("groceries", 0.99);
        let categorizer = Categorizer::default().with_fallback(predictor.clone(), 0.6);
        let result = categorizer
            .categorize(Some("Spotify AB"), Direction::Debit)
            .await
            .unwrap();
        assert_eq!(result.category_key, "subscriptions");
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_accepted_at_threshold() {
        let predictor = FixedPredictor::new("groceries", 0.6);
        let categorizer = Categorizer::default().with_fallback(predictor, 0.6);
        let result = categorizer
            .categorize(Some("Pingo Doce Lisboa"), Direction::Debit)
            .await
            .unwrap();
        assert_eq!(result.category_key, "groceries");
        assert_eq!(result.source, ClassificationSource::Model);
        assert_eq!(result.confidence, 0.6);
    }

    #[tokio::test]
    async fn fallback_rejected_below_threshold() {
        let predictor = FixedPredictor::new("groceries", 0.59);
        let categorizer = Categorizer::default().with_fallback(predictor.clone(), 0.6);
        let result = categorizer
            .categorize(Some("Pingo Doce Lisboa"), Direction::Debit)
            .await
            .unwrap();
        assert_eq!(result, Categorization::uncategorized());
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_errors_propagate() {
        let categorizer = Categorizer::default().with_fallback(Arc::new(BrokenPredictor), 0.6);
        let err = categorizer
            .categorize(Some("Pingo Doce"), Direction::Debit)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model unavailable"));
    }

    #[test]
    fn known_keys_include_uncategorized() {
        let categorizer = Categorizer::default();
        let keys = categorizer.known_category_keys();
        assert!(keys.contains(&"transport"));
        assert_eq!(keys.last(), Some(&UNCATEGORIZED));
    }
}
