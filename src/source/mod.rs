//! Upstream event sources.
//!
//! A source hands out records one at a time and keeps a durable cursor.
//! Until a record is committed, every poll returns that same record again:
//! the consumer either commits it or gets it redelivered, never skips it.

pub mod jsonl;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SourceError;

pub use jsonl::JsonLinesSource;
pub use memory::MemorySource;

/// One raw record pulled from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// Position in the stream; committing it moves the cursor past it.
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// An at-least-once stream of raw event payloads.
#[async_trait]
pub trait EventSource: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the earliest uncommitted record.
    ///
    /// `Ok(None)` means nothing arrived in time, which is not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceRecord>, SourceError>;

    /// Durably advance the cursor past `record`.
    ///
    /// Must be the record most recently returned by `poll`.
    async fn commit(&mut self, record: &SourceRecord) -> Result<(), SourceError>;
}
