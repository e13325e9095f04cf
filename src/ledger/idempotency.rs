use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::error::LedgerResult;
use crate::store::retry::{with_backoff, RetryPolicy};
use crate::store::{LedgerStore, OpScope, Reservation};

/// Reserve-execute-complete protocol for operations whose outcome must be
/// replayable even when they leave no ledger row (a free-quota charge, a
/// webhook that marks an order failed).
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn LedgerStore>,
    takeover: Duration,
    retry: RetryPolicy,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn LedgerStore>, takeover_secs: i64, retry: RetryPolicy) -> Self {
        Self {
            store,
            takeover: Duration::seconds(takeover_secs),
            retry,
        }
    }

    /// Claim `(scope, key)`. `Proceed` means the caller owns the side effect
    /// and must finish with `complete` or `abandon`. `Replay` carries the
    /// outcome recorded by the first execution. A pending claim younger than
    /// the takeover window fails with `IdempotencyConflict`; an older one is
    /// treated as a crashed owner and taken over.
    pub async fn reserve(&self, scope: OpScope, key: &str) -> LedgerResult<Reservation> {
        with_backoff(&self.retry, || {
            self.store
                .begin_operation(scope, key, Utc::now(), self.takeover)
        })
        .await
    }

    pub async fn complete<T: Serialize>(
        &self,
        scope: OpScope,
        key: &str,
        outcome: &T,
    ) -> LedgerResult<()> {
        let value = serde_json::to_value(outcome).map_err(|err| {
            crate::error::LedgerError::StorageUnavailable(format!(
                "unserializable operation outcome: {err}"
            ))
        })?;
        with_backoff(&self.retry, || {
            self.store
                .complete_operation(scope, key, value.clone(), Utc::now())
        })
        .await
    }

    /// Drop the pending claim so the caller's client can retry. Called when
    /// the guarded operation fails with a domain error.
    pub async fn abandon(&self, scope: OpScope, key: &str) -> LedgerResult<()> {
        with_backoff(&self.retry, || self.store.abandon_operation(scope, key)).await
    }
}
