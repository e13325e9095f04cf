use std::sync::Arc;

use crate::error::LedgerResult;
use crate::models::{LedgerEntry, NewEntry};
use crate::store::retry::{with_backoff, RetryPolicy};
use crate::store::LedgerStore;

/// Balance reads and ledger appends. The ledger is the source of truth; the
/// wallet balance is a cache the store keeps in step with every append.
#[derive(Clone)]
pub struct WalletStore {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
}

impl WalletStore {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn balance(&self, user_id: &str) -> LedgerResult<i64> {
        with_backoff(&self.retry, || self.store.balance(user_id)).await
    }

    /// Append one entry. Credits always succeed; a debit that would push the
    /// balance below zero fails with `InsufficientCredits`, and a reused
    /// idempotency key fails with `IdempotencyConflict` carrying the prior
    /// entry.
    pub async fn apply_entry(&self, entry: &NewEntry) -> LedgerResult<LedgerEntry> {
        with_backoff(&self.retry, || self.store.apply_entry(entry)).await
    }

    pub async fn entries(&self, user_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        with_backoff(&self.retry, || self.store.entries(user_id)).await
    }

    /// Recompute the cached balance from the ledger. Recovery tool; normal
    /// operation never needs it.
    pub async fn rebuild_balance(&self, user_id: &str) -> LedgerResult<i64> {
        with_backoff(&self.retry, || self.store.rebuild_balance(user_id)).await
    }
}
