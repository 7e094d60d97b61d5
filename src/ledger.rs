//! Billing ledger updates for completed attempts.

use crate::store::{LedgerStore, StoreError};
use crate::usage::UsageRecord;
use std::sync::Arc;

/// Applies successful usage records to the caller's monthly token counter.
#[derive(Clone)]
pub struct BillingLedgerUpdater {
    ledger: Arc<dyn LedgerStore>,
}

impl BillingLedgerUpdater {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Add the record's total tokens to the ledger. Failed attempts are never applied.
    ///
    /// Returns whether the ledger was touched. Store failures propagate so the caller can
    /// surface them; a lost increment would understate billing.
    pub async fn apply(&self, record: &UsageRecord) -> Result<bool, StoreError> {
        if !record.outcome.is_success() {
            return Ok(false);
        }
        self.ledger
            .increment_monthly_usage(&record.caller_id, record.tokens.total())
            .await?;
        Ok(true)
    }
}
