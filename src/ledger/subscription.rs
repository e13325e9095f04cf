use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::LedgerResult;
use crate::models::{period_key, LedgerEntry};
use crate::store::retry::{with_backoff, RetryPolicy};
use crate::store::LedgerStore;

/// Monthly subscription grants. A grant credits the plan's points once per
/// calendar period and refreshes the subscriber's free-quota caps; running it
/// again in the same period is a no-op.
#[derive(Clone)]
pub struct SubscriptionPlanEngine {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
}

impl SubscriptionPlanEngine {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Grant the current period's points to `user_id` if their subscription
    /// is active and the period has not been granted yet.
    pub async fn grant_if_due(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEntry>> {
        let Some((subscription, plan)) =
            with_backoff(&self.retry, || self.store.subscription(user_id)).await?
        else {
            return Ok(None);
        };
        if !subscription.is_active(now) {
            return Ok(None);
        }
        let period = period_key(now);
        if subscription.last_granted_period.as_deref() == Some(period.as_str()) {
            return Ok(None);
        }

        let entry = with_backoff(&self.retry, || {
            self.store
                .apply_subscription_grant(user_id, &plan, &period, now)
        })
        .await?;
        if let Some(entry) = &entry {
            tracing::info!(
                user_id,
                plan = %plan.name,
                period = %period,
                amount = entry.amount,
                "granted subscription points"
            );
        }
        Ok(entry)
    }

    /// Sweep pass over all subscribers. Returns how many grants were issued.
    pub async fn grant_all_due(&self, now: DateTime<Utc>) -> LedgerResult<u64> {
        let users = with_backoff(&self.retry, || self.store.subscribed_users()).await?;
        let mut granted = 0;
        for user_id in users {
            if self.grant_if_due(&user_id, now).await?.is_some() {
                granted += 1;
            }
        }
        Ok(granted)
    }
}
