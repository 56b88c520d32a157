//! Inbound transaction events.
//!
//! Upstream publishes one JSON object per record. `decode` turns the raw
//! payload into a validated `TransactionEvent` or a `DecodeError`; nothing
//! past this point ever sees untyped JSON.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Money movement direction as reported by the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[serde(alias = "credit", alias = "Credit")]
    Credit,
    #[serde(alias = "debit", alias = "Debit")]
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "CREDIT",
            Direction::Debit => "DEBIT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bank transaction as published by the sync service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub transaction_id: i64,
    #[serde(default)]
    pub user_id: Option<String>,
    pub account_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub direction: Direction,
    pub booking_date: NaiveDate,
    #[serde(default)]
    pub description_raw: Option<String>,
    #[serde(default)]
    pub description_display: Option<String>,
    /// Legacy single-description field, used only when both others are empty.
    #[serde(default)]
    pub description: Option<String>,
}

impl TransactionEvent {
    /// Description used for rule classification.
    ///
    /// Display text wins over raw text, which wins over the legacy field.
    /// Blank strings count as absent.
    pub fn effective_description(&self) -> Option<&str> {
        [
            &self.description_display,
            &self.description_raw,
            &self.description,
        ]
        .into_iter()
        .filter_map(|d| d.as_deref())
        .find(|d| !d.trim().is_empty())
    }
}

/// Decode one stream record into a `TransactionEvent`.
pub fn decode(payload: &[u8]) -> Result<TransactionEvent, DecodeError> {
    let event: TransactionEvent = serde_json::from_slice(payload)?;

    if event.transaction_id <= 0 {
        return Err(DecodeError::InvalidField {
            field: "transactionId",
            reason: format!("must be positive, got {}", event.transaction_id),
        });
    }
    if event.currency.trim().is_empty() {
        return Err(DecodeError::InvalidField {
            field: "currency",
            reason: "must not be empty".into(),
        });
    }

    Ok(event)
}
