//! Batch merchant reconciliation.
//!
//! Walks every transaction without a merchant in id order and links the ones
//! the current merchant set can match. Useful after new merchants or aliases
//! are added, since the consumer only links at ingestion time.

use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::merchants::MerchantMatcher;
use crate::store::Database;

/// Totals for one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Unlinked transactions examined.
    pub reviewed: usize,
    /// Transactions that got a merchant.
    pub linked: usize,
}

/// Link unlinked transactions to merchants, `batch_size` rows at a time.
///
/// Pages by id rather than re-querying from the start, so rows that stay
/// unmatched are visited once and the run always terminates.
pub async fn reconcile_merchants(
    db: &dyn Database,
    matcher: &MerchantMatcher,
    batch_size: usize,
) -> Result<ReconcileReport, DatabaseError> {
    let batch_size = batch_size.max(1);
    let mut report = ReconcileReport::default();

    if matcher.is_empty() {
        info!("No merchants loaded; nothing to reconcile");
        return Ok(report);
    }

    let mut after_id = 0;
    loop {
        let page = db.fetch_unlinked_transactions(after_id, batch_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        after_id = last.id;

        for tx in &page {
            report.reviewed += 1;
            let Some(found) = matcher.find(
                tx.description_raw.as_deref(),
                tx.description_display.as_deref(),
            ) else {
                continue;
            };

            if db.update_transaction_merchant(tx.id, found.merchant.id).await? {
                report.linked += 1;
                debug!(
                    tx_id = tx.id,
                    merchant = %found.merchant.key,
                    via = %found.matched_on,
                    "Linked transaction to merchant"
                );
            }
        }

        if page.len() < batch_size {
            break;
        }
    }

    info!(
        reviewed = report.reviewed,
        linked = report.linked,
        "Merchant reconciliation finished"
    );
    Ok(report)
}
