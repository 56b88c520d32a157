//! Persistence layer: libSQL-backed storage for classifications and
//! merchant links.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, MerchantRecord, StoredClassification, UnlinkedTransaction};
