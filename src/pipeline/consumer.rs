//! Ingestion loop: pulls transaction events from a source, classifies
//! them, links merchants and commits the cursor only once all of that is
//! durably recorded.
//!
//! Per event:
//! 1. `poll()` the source (bounded wait; nothing arriving is fine)
//! 2. `decode()`; malformed payloads are logged and committed
//! 3. `Categorizer::categorize()` on the effective description
//! 4. resolve the category key; unknown keys are logged and committed
//! 5. `upsert_classification()`
//! 6. `MerchantMatcher::find()` + conditional `update_transaction_merchant()`
//! 7. `commit()`
//!
//! Any failure in 3-7 leaves the record uncommitted so the source hands it
//! out again after a backoff. Upserts and conditional merchant updates make
//! the replay safe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::events::{TransactionEvent, decode};
use crate::pipeline::categorizer::Categorizer;
use crate::pipeline::merchants::MerchantMatcher;
use crate::pipeline::types::{ClassificationResult, MerchantLink};
use crate::source::{EventSource, SourceRecord};
use crate::store::Database;

/// Loop tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub poll_timeout: Duration,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
        }
    }
}

/// Why an event was committed without recording a classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Payload could not be decoded into a transaction event.
    Malformed(String),
    /// Categorizer produced a key the store does not know.
    UnknownCategory { transaction_id: i64, key: String },
}

/// Result of one loop iteration.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing arrived within the poll timeout.
    Idle,
    /// Event fully processed and committed.
    Committed {
        offset: u64,
        result: ClassificationResult,
    },
    /// Event committed without effects.
    Skipped { offset: u64, reason: SkipReason },
    /// Event left uncommitted; it will be redelivered.
    Retry { offset: Option<u64>, error: Error },
}

/// What handling a decoded event produced.
enum Handled {
    Recorded(ClassificationResult),
    UnknownCategory(String),
}

/// Sequential at-least-once consumer.
pub struct Consumer<S> {
    source: S,
    db: Arc<dyn Database>,
    categorizer: Categorizer,
    merchants: MerchantMatcher,
    config: ConsumerConfig,
    backoff: Duration,
}

impl<S: EventSource> Consumer<S> {
    pub fn new(
        source: S,
        db: Arc<dyn Database>,
        categorizer: Categorizer,
        merchants: MerchantMatcher,
        config: ConsumerConfig,
    ) -> Self {
        let backoff = config.retry_backoff;
        Self {
            source,
            db,
            categorizer,
            merchants,
            config,
            backoff,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run until `shutdown` is set.
    ///
    /// The flag is checked once per iteration, so an event already in
    /// flight always finishes first.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) {
        info!(
            source = self.source.name(),
            merchants = self.merchants.len(),
            "Consumer started"
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!(source = self.source.name(), "Consumer shutting down");
                return;
            }

            match self.process_next().await {
                Outcome::Retry { .. } => {
                    let delay = self.next_backoff();
                    debug!(?delay, "Backing off before retry");
                    tokio::time::sleep(delay).await;
                }
                Outcome::Committed { .. } | Outcome::Skipped { .. } => {
                    self.backoff = self.config.retry_backoff;
                }
                Outcome::Idle => {}
            }
        }
    }

    /// Poll for one event and drive it to a final state.
    pub async fn process_next(&mut self) -> Outcome {
        let record = match self.source.poll(self.config.poll_timeout).await {
            Ok(Some(record)) => record,
            Ok(None) => return Outcome::Idle,
            Err(e) => {
                error!(source = self.source.name(), error = %e, "Event source poll failed");
                return Outcome::Retry {
                    offset: None,
                    error: e.into(),
                };
            }
        };

        let offset = record.offset;

        let event = match decode(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(offset, error = %e, "Discarding undecodable event");
                let reason = SkipReason::Malformed(e.to_string());
                return self.commit(&record, Outcome::Skipped { offset, reason }).await;
            }
        };

        let tx_id = event.transaction_id;
        match self.handle(&event).await {
            Ok(Handled::Recorded(result)) => {
                self.commit(&record, Outcome::Committed { offset, result })
                    .await
            }
            Ok(Handled::UnknownCategory(key)) => {
                let reason = SkipReason::UnknownCategory {
                    transaction_id: tx_id,
                    key,
                };
                self.commit(&record, Outcome::Skipped { offset, reason })
                    .await
            }
            Err(e) => {
                error!(offset, tx_id, error = %e, "Failed to process event; will retry");
                Outcome::Retry {
                    offset: Some(offset),
                    error: e,
                }
            }
        }
    }

    /// Steps 3-6 for a decoded event.
    async fn handle(&self, event: &TransactionEvent) -> Result<Handled, Error> {
        let tx_id = event.transaction_id;

        let categorization = self
            .categorizer
            .categorize(event.effective_description(), event.direction)
            .await?;

        let Some(category_id) = self
            .db
            .lookup_category_id(&categorization.category_key)
            .await?
        else {
            warn!(
                tx_id,
                category = %categorization.category_key,
                "Category key not found in categories table"
            );
            return Ok(Handled::UnknownCategory(categorization.category_key));
        };

        self.db
            .upsert_classification(
                tx_id,
                category_id,
                categorization.confidence,
                categorization.source,
            )
            .await?;
        info!(
            tx_id,
            category = %categorization.category_key,
            category_id,
            source = %categorization.source,
            "Transaction categorized"
        );

        let merchant = match self.merchants.find(
            event.description_raw.as_deref(),
            event.description_display.as_deref(),
        ) {
            Some(found) => {
                let changed = self
                    .db
                    .update_transaction_merchant(tx_id, found.merchant.id)
                    .await?;
                info!(
                    tx_id,
                    merchant = %found.merchant.key,
                    via = %found.matched_on,
                    keyword = found.keyword,
                    changed,
                    "Transaction linked to merchant"
                );
                Some(MerchantLink {
                    merchant_id: found.merchant.id,
                    merchant_key: found.merchant.key.clone(),
                    keyword: found.keyword.to_string(),
                    matched_on: found.matched_on,
                })
            }
            None => None,
        };

        Ok(Handled::Recorded(ClassificationResult {
            transaction_id: tx_id,
            category_key: categorization.category_key,
            category_id,
            confidence: categorization.confidence,
            source: categorization.source,
            merchant,
        }))
    }

    /// Commit `record`; on failure the outcome becomes a retry.
    async fn commit(&mut self, record: &SourceRecord, outcome: Outcome) -> Outcome {
        match self.source.commit(record).await {
            Ok(()) => outcome,
            Err(e) => {
                error!(offset = record.offset, error = %e, "Commit failed; event will be redelivered");
                Outcome::Retry {
                    offset: Some(record.offset),
                    error: e.into(),
                }
            }
        }
    }

    /// Current backoff, doubling the next one up to the cap.
    fn next_backoff(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.config.retry_backoff_max);
        delay
    }
}

/// Category keys the categorizer can emit that the store cannot resolve.
///
/// Each missing key is logged; events that land on one are skipped.
pub async fn verify_category_keys(
    db: &dyn Database,
    categorizer: &Categorizer,
) -> Result<Vec<String>, crate::error::DatabaseError> {
    let mut missing = Vec::new();
    for key in categorizer.known_category_keys() {
        if db.lookup_category_id(key).await?.is_none() {
            warn!(category = key, "Category key has no row in categories table");
            missing.push(key.to_string());
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::merchants::{MatchedOn, Merchant};
    use crate::pipeline::types::ClassificationSource;
    use crate::source::MemorySource;
    use crate::store::{LibSqlBackend, StoredClassification};

    fn event_json(id: i64, direction: &str, raw: &str, display: Option<&str>) -> String {
        let mut value = serde_json::json!({
            "transactionId": id,
            "userId": "user-1",
            "accountId": 1,
            "amount": 9.99,
            "currency": "EUR",
            "direction": direction,
            "bookingDate": "2025-12-10",
            "descriptionRaw": raw,
        });
        if let Some(display) = display {
            value["descriptionDisplay"] = serde_json::Value::String(display.into());
        }
        value.to_string()
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            poll_timeout: Duration::from_millis(1),
            retry_backoff: Duration::from_millis(1),
            retry_backoff_max: Duration::from_millis(4),
        }
    }

    async fn consumer_with(
        payloads: Vec<String>,
        merchants: Vec<Merchant>,
    ) -> (Consumer<MemorySource>, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let consumer = Consumer::new(
            MemorySource::with_payloads(payloads),
            db.clone(),
            Categorizer::default(),
            MerchantMatcher::new(merchants),
            fast_config(),
        );
        (consumer, db)
    }

    #[tokio::test]
    async fn classifies_and_commits() {
        let (mut consumer, db) =
            consumer_with(vec![event_json(1, "DEBIT", "UBER *TRIP", None)], vec![]).await;

        let outcome = consumer.process_next().await;
        let Outcome::Committed { offset, result } = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert_eq!(offset, 0);
        assert_eq!(result.category_key, "transport");
        assert_eq!(result.source, ClassificationSource::Rule);
        assert_eq!(consumer.source().committed(), &[0]);

        let stored = db.get_classification(1).await.unwrap().unwrap();
        assert_eq!(
            Some(stored.category_id),
            db.lookup_category_id("transport").await.unwrap()
        );
    }

    #[tokio::test]
    async fn links_merchant_from_raw_description() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let uber = db.insert_merchant("uber", "Uber", &[]).await.unwrap();
        let eats = db.insert_merchant("ubereats", "Uber Eats", &[]).await.unwrap();
        let payload = event_json(5, "DEBIT", "UBER EATS ORDER", None);
        db.insert_transaction(&decode(payload.as_bytes()).unwrap())
            .await
            .unwrap();

        let merchants = vec![
            Merchant::new(uber, "uber", "Uber", &[] as &[&str]),
            Merchant::new(eats, "ubereats", "Uber Eats", &[] as &[&str]),
        ];
        let mut consumer = Consumer::new(
            MemorySource::with_payloads([payload]),
            db.clone(),
            Categorizer::default(),
            MerchantMatcher::new(merchants),
            fast_config(),
        );

        let Outcome::Committed { result, .. } = consumer.process_next().await else {
            panic!("expected commit");
        };
        let link = result.merchant.unwrap();
        assert_eq!(link.merchant_id, eats);
        assert_eq!(link.keyword, "uber eats");
        assert_eq!(link.matched_on, MatchedOn::Raw);
        assert_eq!(db.transaction_merchant(5).await.unwrap(), Some(eats));
    }

    #[tokio::test]
    async fn unknown_description_is_uncategorized_without_merchant() {
        let (mut consumer, _db) = consumer_with(
            vec![event_json(2, "DEBIT", "XYZ123 PURCHASE", None)],
            vec![Merchant::new(1, "uber", "Uber", &[] as &[&str])],
        )
        .await;

        let Outcome::Committed { result, .. } = consumer.process_next().await else {
            panic!("expected commit");
        };
        assert_eq!(result.category_key, "uncategorized");
        assert_eq!(result.source, ClassificationSource::Default);
        assert!(result.merchant.is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_payload_is_skipped_and_committed() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut consumer = Consumer::new(
            MemorySource::with_payloads([
                vec![0xff, 0xfe],
                event_json(3, "DEBIT", "UBER", None).into_bytes(),
            ]),
            db,
            Categorizer::default(),
            MerchantMatcher::default(),
            fast_config(),
        );

        assert!(matches!(
            consumer.process_next().await,
            Outcome::Skipped {
                offset: 0,
                reason: SkipReason::Malformed(_)
            }
        ));
        assert!(matches!(
            consumer.process_next().await,
            Outcome::Committed { offset: 1, .. }
        ));
        assert_eq!(consumer.source().committed(), &[0, 1]);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped_and_committed() {
        let (mut consumer, _db) = consumer_with(
            vec![
                "{not json".to_string(),
                event_json(3, "CREDIT", "Subsídio de Natal", None),
            ],
            vec![],
        )
        .await;

        let outcome = consumer.process_next().await;
        assert!(matches!(
            outcome,
            Outcome::Skipped {
                offset: 0,
                reason: SkipReason::Malformed(_)
            }
        ));

        let Outcome::Committed { offset, result } = consumer.process_next().await else {
            panic!("expected commit");
        };
        assert_eq!(offset, 1);
        assert_eq!(result.category_key, "salary");
        assert_eq!(consumer.source().committed(), &[0, 1]);
    }

    #[tokio::test]
    async fn empty_source_is_idle() {
        let (mut consumer, _db) = consumer_with(vec![], vec![]).await;
        assert!(matches!(consumer.process_next().await, Outcome::Idle));
    }

    #[tokio::test]
    async fn run_stops_when_flag_is_set() {
        let (mut consumer, _db) = consumer_with(
            vec![
                event_json(1, "DEBIT", "UBER", None),
                event_json(2, "DEBIT", "SPOTIFY", None),
            ],
            vec![],
        )
        .await;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::Relaxed);
        });

        tokio::time::timeout(Duration::from_secs(5), consumer.run(shutdown))
            .await
            .expect("consumer did not stop");
        stopper.await.unwrap();
        assert_eq!(consumer.source().committed(), &[0, 1]);
    }

    #[tokio::test]
    async fn seeded_store_knows_every_rule_category() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let missing = verify_category_keys(&db, &Categorizer::default())
            .await
            .unwrap();
        assert!(missing.is_empty(), "missing: {missing:?}");
    }

    #[tokio::test]
    async fn unseeded_category_is_reported_and_skipped() {
        use crate::pipeline::rules::{Rule, RuleClassifier};

        let mut rules = RuleClassifier::empty();
        rules.push(Rule::contains("lottery", "windfall"));
        let categorizer = Categorizer::new(rules);

        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        assert_eq!(
            verify_category_keys(db.as_ref(), &categorizer).await.unwrap(),
            vec!["windfall".to_string()]
        );

        let mut consumer = Consumer::new(
            MemorySource::with_payloads([event_json(9, "CREDIT", "LOTTERY PRIZE", None)]),
            db.clone(),
            categorizer,
            MerchantMatcher::default(),
            fast_config(),
        );
        let outcome = consumer.process_next().await;
        assert!(matches!(
            outcome,
            Outcome::Skipped {
                offset: 0,
                reason: SkipReason::UnknownCategory { transaction_id: 9, .. }
            }
        ));
        assert_eq!(consumer.source().committed(), &[0]);
        assert!(db.get_classification(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_failure_leaves_event_uncommitted_until_it_recovers() {
        let inner = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let flaky = Arc::new(FlakyDb {
            inner: inner.clone(),
            failures_left: std::sync::atomic::AtomicUsize::new(2),
        });
        let mut consumer = Consumer::new(
            MemorySource::with_payloads([event_json(4, "DEBIT", "JETBRAINS IDE", None)]),
            flaky,
            Categorizer::default(),
            MerchantMatcher::default(),
            fast_config(),
        );

        for _ in 0..2 {
            let outcome = consumer.process_next().await;
            assert!(matches!(outcome, Outcome::Retry { offset: Some(0), .. }));
            assert!(consumer.source().committed().is_empty());
        }

        let Outcome::Committed { result, .. } = consumer.process_next().await else {
            panic!("expected commit after recovery");
        };
        assert_eq!(result.category_key, "software");
        assert_eq!(consumer.source().deliveries(), 3);
        assert_eq!(inner.classification_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn redelivered_event_leaves_same_end_state() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let spotify = db.insert_merchant("spotify", "Spotify", &[]).await.unwrap();
        let payload = event_json(6, "DEBIT", "PAYPAL *SPOTIFY", Some("Spotify AB"));
        db.insert_transaction(&decode(payload.as_bytes()).unwrap())
            .await
            .unwrap();

        let mut consumer = Consumer::new(
            MemorySource::with_payloads([payload.clone(), payload]),
            db.clone(),
            Categorizer::default(),
            MerchantMatcher::new(vec![Merchant::new(
                spotify,
                "spotify",
                "Spotify",
                &[] as &[&str],
            )]),
            fast_config(),
        );

        let snapshot = |c: StoredClassification| (c.category_id, c.confidence, c.source);

        assert!(matches!(
            consumer.process_next().await,
            Outcome::Committed { .. }
        ));
        let first = snapshot(db.get_classification(6).await.unwrap().unwrap());
        assert_eq!(db.transaction_merchant(6).await.unwrap(), Some(spotify));

        let Outcome::Committed { result, .. } = consumer.process_next().await else {
            panic!("expected commit on redelivery");
        };
        assert_eq!(result.merchant.map(|m| m.merchant_id), Some(spotify));

        let second = snapshot(db.get_classification(6).await.unwrap().unwrap());
        assert_eq!(first, second);
        assert_eq!(
            Some(second.0),
            db.lookup_category_id("subscriptions").await.unwrap()
        );
        assert_eq!(second.2, ClassificationSource::Rule);
        assert_eq!(db.transaction_merchant(6).await.unwrap(), Some(spotify));
        assert_eq!(db.classification_count().await.unwrap(), 1);
        assert_eq!(consumer.source().committed(), &[0, 1]);
    }

    /// Fails `upsert_classification` a fixed number of times, then delegates.
    struct FlakyDb {
        inner: Arc<LibSqlBackend>,
        failures_left: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Database for FlakyDb {
        async fn run_migrations(&self) -> Result<(), crate::error::DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn lookup_category_id(
            &self,
            key: &str,
        ) -> Result<Option<i64>, crate::error::DatabaseError> {
            self.inner.lookup_category_id(key).await
        }
        async fn upsert_classification(
            &self,
            transaction_id: i64,
            category_id: i64,
            confidence: f64,
            source: ClassificationSource,
        ) -> Result<(), crate::error::DatabaseError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(crate::error::DatabaseError::Query("connection reset".into()));
            }
            self.inner
                .upsert_classification(transaction_id, category_id, confidence, source)
                .await
        }
        async fn get_classification(
            &self,
            transaction_id: i64,
        ) -> Result<Option<crate::store::StoredClassification>, crate::error::DatabaseError>
        {
            self.inner.get_classification(transaction_id).await
        }
        async fn fetch_merchants(
            &self,
        ) -> Result<Vec<crate::store::MerchantRecord>, crate::error::DatabaseError> {
            self.inner.fetch_merchants().await
        }
        async fn update_transaction_merchant(
            &self,
            transaction_id: i64,
            merchant_id: i64,
        ) -> Result<bool, crate::error::DatabaseError> {
            self.inner
                .update_transaction_merchant(transaction_id, merchant_id)
                .await
        }
        async fn fetch_unlinked_transactions(
            &self,
            after_id: i64,
            limit: usize,
        ) -> Result<Vec<crate::store::UnlinkedTransaction>, crate::error::DatabaseError> {
            self.inner.fetch_unlinked_transactions(after_id, limit).await
        }
        async fn health_check(&self) -> bool {
            self.inner.health_check().await
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let db: Arc<dyn Database> = Arc::new(NeverDb);
        let mut consumer = Consumer::new(
            MemorySource::new(),
            db,
            Categorizer::default(),
            MerchantMatcher::default(),
            fast_config(),
        );
        let delays: Vec<u128> = (0..5).map(|_| consumer.next_backoff().as_millis()).collect();
        assert_eq!(delays, vec![1, 2, 4, 4, 4]);
    }

    /// Store that is never reached in the backoff test.
    struct NeverDb;

    #[async_trait::async_trait]
    impl Database for NeverDb {
        async fn run_migrations(&self) -> Result<(), crate::error::DatabaseError> {
            unimplemented!()
        }
        async fn lookup_category_id(
            &self,
            _key: &str,
        ) -> Result<Option<i64>, crate::error::DatabaseError> {
            unimplemented!()
        }
        async fn upsert_classification(
            &self,
            _transaction_id: i64,
            _category_id: i64,
            _confidence: f64,
            _source: ClassificationSource,
        ) -> Result<(), crate::error::DatabaseError> {
            unimplemented!()
        }
        async fn get_classification(
            &self,
            _transaction_id: i64,
        ) -> Result<Option<crate::store::StoredClassification>, crate::error::DatabaseError>
        {
            unimplemented!()
        }
        async fn fetch_merchants(
            &self,
        ) -> Result<Vec<crate::store::MerchantRecord>, crate::error::DatabaseError> {
            unimplemented!()
        }
        async fn update_transaction_merchant(
            &self,
            _transaction_id: i64,
            _merchant_id: i64,
        ) -> Result<bool, crate::error::DatabaseError> {
            unimplemented!()
        }
        async fn fetch_unlinked_transactions(
            &self,
            _after_id: i64,
            _limit: usize,
        ) -> Result<Vec<crate::store::UnlinkedTransaction>, crate::error::DatabaseError> {
            unimplemented!()
        }
        async fn health_check(&self) -> bool {
            false
        }
    }
}
