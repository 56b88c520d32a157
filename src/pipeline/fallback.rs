//! Secondary classifier extension point.
//!
//! Only consulted when the rule list produces nothing. No implementation
//! ships with the service; deployments plug one in through
//! [`Categorizer::with_fallback`](crate::pipeline::categorizer::Categorizer::with_fallback).

use async_trait::async_trait;

use crate::error::ClassifierError;
use crate::events::Direction;

/// A category guess with the classifier's own confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub category_key: String,
    /// 0.0 to 1.0.
    pub confidence: f64,
}

/// Capability interface for a non-rule classifier.
#[async_trait]
pub trait FallbackClassifier: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Predict a category for an already-normalized description.
    async fn predict(
        &self,
        normalized: &str,
        direction: Direction,
    ) -> Result<Prediction, ClassifierError>;
}
