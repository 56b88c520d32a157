//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file, in-memory and remote (`libsql://`) databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::config::DatabaseTarget;
use crate::error::DatabaseError;
use crate::events::TransactionEvent;
use crate::pipeline::types::ClassificationSource;
use crate::store::migrations;
use crate::store::traits::{Database, MerchantRecord, StoredClassification, UnlinkedTransaction};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    /// Held so the database outlives `conn`; never read.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open whichever database the configuration points at.
    pub async fn open(target: &DatabaseTarget) -> Result<Self, DatabaseError> {
        match target {
            DatabaseTarget::Local(path) => Self::new_local(path).await,
            DatabaseTarget::Remote { url, auth_token } => {
                Self::new_remote(url, auth_token.clone()).await
            }
        }
    }

    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Connect to a remote libSQL server and run migrations.
    pub async fn new_remote(url: &str, auth_token: SecretString) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_remote(url.to_string(), auth_token.expose_secret().to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to connect to {url}: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(%url, "Remote database connected");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Reference data and fixtures ─────────────────────────────────
    //
    // Categories, merchants and transactions are owned by other services
    // in production. These writers exist for seeding and tests.

    /// Insert a category, returning its id.
    pub async fn insert_category(&self, key: &str, name: &str) -> Result<i64, DatabaseError> {
        self.query_id(
            "INSERT INTO categories (key, name) VALUES (?1, ?2) RETURNING id",
            params![key, name],
        )
        .await
    }

    /// Insert a merchant, returning its id.
    pub async fn insert_merchant(
        &self,
        key: &str,
        name: &str,
        aliases: &[&str],
    ) -> Result<i64, DatabaseError> {
        let aliases = serde_json::to_string(aliases)
            .map_err(|e| DatabaseError::Serialization(format!("merchant aliases: {e}")))?;
        self.query_id(
            "INSERT INTO merchants (key, name, aliases) VALUES (?1, ?2, ?3) RETURNING id",
            params![key, name, aliases],
        )
        .await
    }

    /// Record a transaction row from an event. Existing rows are left as is.
    pub async fn insert_transaction(&self, event: &TransactionEvent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO transactions
                    (id, account_id, user_id, amount, currency, direction, booking_date,
                     description_raw, description_display)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.transaction_id,
                    event.account_id,
                    event.user_id.clone(),
                    event.amount.to_string(),
                    event.currency.clone(),
                    event.direction.as_str(),
                    event.booking_date.to_string(),
                    event.description_raw.clone(),
                    event.description_display.clone()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_transaction: {e}")))?;
        Ok(())
    }

    /// Merchant currently linked to a transaction.
    pub async fn transaction_merchant(
        &self,
        transaction_id: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT merchant_id FROM transactions WHERE id = ?1",
                params![transaction_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transaction_merchant: {e}")))?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<i64>>(0)?),
            None => Ok(None),
        }
    }

    /// Number of stored classifications.
    pub async fn classification_count(&self) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM transaction_categories", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("classification_count: {e}")))?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }

    async fn query_id(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{sql}: {e}")))?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Err(DatabaseError::Query(format!("{sql}: no id returned"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Map a libsql Row to a MerchantRecord.
///
/// Column order: 0:id, 1:key, 2:name, 3:aliases (JSON array).
fn row_to_merchant(row: &libsql::Row) -> Result<MerchantRecord, DatabaseError> {
    let id: i64 = row.get(0)?;
    let key: String = row.get(1)?;
    let name: String = row.get(2)?;
    let aliases_json: Option<String> = row.get(3)?;

    let aliases = match aliases_json.as_deref() {
        None | Some("") => Vec::new(),
        Some(json) => serde_json::from_str::<Vec<String>>(json).map_err(|e| {
            DatabaseError::Serialization(format!("aliases for merchant {id}: {e}"))
        })?,
    };

    Ok(MerchantRecord {
        id,
        key,
        name,
        aliases,
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn lookup_category_id(&self, key: &str) -> Result<Option<i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT id FROM categories WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup_category_id: {e}")))?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    async fn upsert_classification(
        &self,
        transaction_id: i64,
        category_id: i64,
        confidence: f64,
        source: ClassificationSource,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO transaction_categories (transaction_id, category_id, confidence, source)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (transaction_id) DO UPDATE SET
                    category_id = excluded.category_id,
                    confidence = excluded.confidence,
                    source = excluded.source,
                    updated_at = datetime('now')",
                params![transaction_id, category_id, confidence, source.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_classification: {e}")))?;

        debug!(tx_id = transaction_id, category_id, %source, "Classification upserted");
        Ok(())
    }

    async fn get_classification(
        &self,
        transaction_id: i64,
    ) -> Result<Option<StoredClassification>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT transaction_id, category_id, confidence, source, updated_at
                 FROM transaction_categories WHERE transaction_id = ?1",
                params![transaction_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_classification: {e}")))?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let source_str: String = row.get(3)?;
        let source = source_str
            .parse::<ClassificationSource>()
            .map_err(DatabaseError::Serialization)?;
        let updated_str: String = row.get(4)?;

        Ok(Some(StoredClassification {
            transaction_id: row.get(0)?,
            category_id: row.get(1)?,
            confidence: row.get(2)?,
            source,
            updated_at: parse_datetime(&updated_str),
        }))
    }

    async fn fetch_merchants(&self) -> Result<Vec<MerchantRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT id, key, name, aliases FROM merchants ORDER BY id", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_merchants: {e}")))?;

        let mut merchants = Vec::new();
        while let Some(row) = rows.next().await? {
            match row_to_merchant(&row) {
                Ok(m) => merchants.push(m),
                Err(e) => warn!(error = %e, "Skipping unreadable merchant row"),
            }
        }
        Ok(merchants)
    }

    async fn update_transaction_merchant(
        &self,
        transaction_id: i64,
        merchant_id: i64,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE transactions
                 SET merchant_id = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND (merchant_id IS NULL OR merchant_id <> ?1)",
                params![merchant_id, transaction_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_transaction_merchant: {e}")))?;

        Ok(changed > 0)
    }

    async fn fetch_unlinked_transactions(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<UnlinkedTransaction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, description_raw, description_display
                 FROM transactions
                 WHERE merchant_id IS NULL AND id > ?1
                 ORDER BY id
                 LIMIT ?2",
                params![after_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_unlinked_transactions: {e}")))?;

        let mut page = Vec::new();
        while let Some(row) = rows.next().await? {
            page.push(UnlinkedTransaction {
                id: row.get(0)?,
                description_raw: row.get(1)?,
                description_display: row.get(2)?,
            });
        }
        Ok(page)
    }

    async fn health_check(&self) -> bool {
        let mut rows = match self.conn().query("SELECT 1", ()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                return false;
            }
        };
        match rows.next().await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                false
            }
        }
    }
}
