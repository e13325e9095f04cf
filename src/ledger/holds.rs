use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{Hold, LedgerEntry};
use crate::store::retry::{with_backoff, RetryPolicy};
use crate::store::LedgerStore;

/// Two-phase consumption: authorize reserves credits against the available
/// balance (balance minus other active holds), consume settles for the actual
/// amount, release cancels. Expiry is enforced at consume time; the sweeper
/// marking rows expired is bookkeeping only.
#[derive(Clone)]
pub struct AuthorizationHoldManager {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
}

impl AuthorizationHoldManager {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn authorize(
        &self,
        user_id: &str,
        module: &str,
        amount: i64,
        ttl: Duration,
    ) -> LedgerResult<Hold> {
        if amount <= 0 {
            return Err(LedgerError::BadRequest(
                "authorization amount must be positive".to_string(),
            ));
        }
        if ttl <= Duration::zero() {
            return Err(LedgerError::BadRequest(
                "hold ttl must be positive".to_string(),
            ));
        }
        let hold = with_backoff(&self.retry, || {
            let now = Utc::now();
            self.store.insert_hold(user_id, module, amount, now, now + ttl)
        })
        .await?;
        tracing::info!(
            hold_id = %hold.id,
            user_id,
            module,
            amount,
            "authorized credit hold"
        );
        Ok(hold)
    }

    /// Settle a hold for `actual_amount` (0 <= actual <= authorized) and debit
    /// the wallet under `idempotency_key`. Replaying with the same key returns
    /// the original entry without a second debit.
    pub async fn consume(
        &self,
        hold_id: Uuid,
        actual_amount: i64,
        idempotency_key: &str,
    ) -> LedgerResult<(Hold, LedgerEntry)> {
        if actual_amount < 0 {
            return Err(LedgerError::BadRequest(
                "actual amount must not be negative".to_string(),
            ));
        }
        let (hold, entry) = with_backoff(&self.retry, || {
            self.store
                .consume_hold(hold_id, actual_amount, idempotency_key, Utc::now())
        })
        .await?;
        tracing::info!(
            hold_id = %hold.id,
            user_id = %hold.user_id,
            actual_amount,
            balance_after = entry.balance_after,
            "consumed credit hold"
        );
        Ok((hold, entry))
    }

    pub async fn release(&self, hold_id: Uuid) -> LedgerResult<Hold> {
        let hold =
            with_backoff(&self.retry, || self.store.release_hold(hold_id, Utc::now())).await?;
        tracing::info!(hold_id = %hold.id, user_id = %hold.user_id, "released credit hold");
        Ok(hold)
    }

    pub async fn get(&self, hold_id: Uuid) -> LedgerResult<Hold> {
        with_backoff(&self.retry, || self.store.hold(hold_id))
            .await?
            .ok_or(LedgerError::HoldNotFound(hold_id))
    }
}
