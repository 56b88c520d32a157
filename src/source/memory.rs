//! In-process source backed by a queue.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::source::{EventSource, SourceRecord};

/// Queue-backed source with the same redelivery contract as a real stream.
#[derive(Debug, Default)]
pub struct MemorySource {
    pending: VecDeque<SourceRecord>,
    next_offset: u64,
    committed: Vec<u64>,
    deliveries: usize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source preloaded with payloads, offsets starting at 0.
    pub fn with_payloads<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let mut source = Self::new();
        for payload in payloads {
            source.push(payload);
        }
        source
    }

    /// Append a payload at the tail of the stream. Returns its offset.
    pub fn push(&mut self, payload: impl Into<Vec<u8>>) -> u64 {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.pending.push_back(SourceRecord {
            offset,
            payload: payload.into(),
        });
        offset
    }

    /// Records not yet committed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Offsets committed so far, in commit order.
    pub fn committed(&self) -> &[u64] {
        &self.committed
    }

    /// Total records handed out by `poll`, redeliveries included.
    pub fn deliveries(&self) -> usize {
        self.deliveries
    }
}

#[async_trait]
impl EventSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceRecord>, SourceError> {
        match self.pending.front() {
            Some(record) => {
                self.deliveries += 1;
                Ok(Some(record.clone()))
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn commit(&mut self, record: &SourceRecord) -> Result<(), SourceError> {
        let inflight = self.pending.front().map(|r| r.offset);
        if inflight != Some(record.offset) {
            return Err(SourceError::CommitMismatch {
                offset: record.offset,
                inflight,
            });
        }
        self.pending.pop_front();
        self.committed.push(record.offset);
        Ok(())
    }
}
