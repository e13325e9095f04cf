use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::LedgerResult;
use crate::models::{period_key, QuotaUsage};
use crate::store::retry::{with_backoff, RetryPolicy};
use crate::store::{LedgerStore, OpScope};

/// Monthly free allowance per (user, module). Subscribers get their plan's
/// batch cap, everyone else the configured default. Counters reset by period
/// key; old rows are simply never read again.
#[derive(Clone)]
pub struct QuotaPolicyEngine {
    store: Arc<dyn LedgerStore>,
    default_cap: i64,
    retry: RetryPolicy,
}

impl QuotaPolicyEngine {
    pub fn new(store: Arc<dyn LedgerStore>, default_cap: i64, retry: RetryPolicy) -> Self {
        Self {
            store,
            default_cap,
            retry,
        }
    }

    /// Take one free unit if the period's cap allows it, recording `receipt`
    /// as the done outcome of `(scope, key)` in the same store transaction.
    /// A crash can then never leave a spent free unit behind a claim that a
    /// retry would take over and spend again. Returns false when the cap is
    /// exhausted; the caller falls through to paid credits.
    pub async fn charge_free(
        &self,
        user_id: &str,
        module: &str,
        now: DateTime<Utc>,
        scope: OpScope,
        key: &str,
        receipt: &serde_json::Value,
    ) -> LedgerResult<bool> {
        let period = period_key(now);
        let cap = self.cap_for(user_id, now).await?;
        with_backoff(&self.retry, || {
            self.store.charge_free(
                scope,
                key,
                user_id,
                module,
                &period,
                cap,
                receipt.clone(),
                now,
            )
        })
        .await
    }

    pub async fn usage(
        &self,
        user_id: &str,
        module: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<QuotaUsage>> {
        let period = period_key(now);
        with_backoff(&self.retry, || {
            self.store.quota_usage(user_id, module, &period)
        })
        .await
    }

    async fn cap_for(&self, user_id: &str, now: DateTime<Utc>) -> LedgerResult<i64> {
        let subscription = with_backoff(&self.retry, || self.store.subscription(user_id)).await?;
        Ok(match subscription {
            Some((sub, plan)) if sub.is_active(now) => plan.batch_cap,
            _ => self.default_cap,
        })
    }
}
