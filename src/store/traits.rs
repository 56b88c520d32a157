//! `Database` trait: the persistence port used by the consumer loop and
//! the reconciliation job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::ClassificationSource;

/// A merchant row as stored, before keyword derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantRecord {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub aliases: Vec<String>,
}

/// A transaction that has no merchant linked yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkedTransaction {
    pub id: i64,
    pub description_raw: Option<String>,
    pub description_display: Option<String>,
}

/// The persisted classification for a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredClassification {
    pub transaction_id: i64,
    pub category_id: i64,
    pub confidence: f64,
    pub source: ClassificationSource,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic persistence port.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Categories ──────────────────────────────────────────────────

    /// Resolve a category key to its storage id.
    async fn lookup_category_id(&self, key: &str) -> Result<Option<i64>, DatabaseError>;

    /// Insert or replace the classification for a transaction.
    ///
    /// Keyed by transaction id: repeated calls overwrite, never accumulate.
    async fn upsert_classification(
        &self,
        transaction_id: i64,
        category_id: i64,
        confidence: f64,
        source: ClassificationSource,
    ) -> Result<(), DatabaseError>;

    /// Current classification for a transaction, if any.
    async fn get_classification(
        &self,
        transaction_id: i64,
    ) -> Result<Option<StoredClassification>, DatabaseError>;

    // ── Merchants ───────────────────────────────────────────────────

    /// Load the full merchant catalog.
    async fn fetch_merchants(&self) -> Result<Vec<MerchantRecord>, DatabaseError>;

    /// Link a transaction to a merchant when unset or different.
    ///
    /// Returns `true` if a row changed. Safe to repeat.
    async fn update_transaction_merchant(
        &self,
        transaction_id: i64,
        merchant_id: i64,
    ) -> Result<bool, DatabaseError>;

    /// Page of transactions with no merchant and an id above `after_id`,
    /// ordered by id.
    async fn fetch_unlinked_transactions(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<UnlinkedTransaction>, DatabaseError>;

    // ── Health ──────────────────────────────────────────────────────

    /// Cheap round trip to the store. Never errors; `false` means unreachable.
    async fn health_check(&self) -> bool;
}
