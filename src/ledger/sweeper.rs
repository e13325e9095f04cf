use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config;
use crate::ledger::subscription::SubscriptionPlanEngine;
use crate::ledger::PointsEngine;
use crate::store::LedgerStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub holds_expired: u64,
    pub orders_expired: u64,
    pub grants_issued: u64,
}

/// One maintenance pass: mark overdue holds expired, sweep stale pending
/// orders, issue due subscription grants. Correctness never depends on this
/// running; expiry is re-checked at consume time and grants are
/// once-per-period regardless of cadence.
pub async fn process_tick(
    store: &Arc<dyn LedgerStore>,
    subscriptions: &SubscriptionPlanEngine,
    order_pending_ttl_secs: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<SweepReport> {
    let holds_expired = store.expire_holds(now).await?;
    let cutoff = now - chrono::Duration::seconds(order_pending_ttl_secs);
    let orders_expired = store.expire_orders(cutoff).await?;
    let grants_issued = subscriptions.grant_all_due(now).await?;
    Ok(SweepReport {
        holds_expired,
        orders_expired,
        grants_issued,
    })
}

/// Spawn the background sweep loop.
pub fn spawn(engine: PointsEngine) {
    let interval = Duration::from_secs(*config::SWEEP_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match process_tick(
                engine.store(),
                engine.subscriptions(),
                engine.settings().order_pending_ttl_secs,
                Utc::now(),
            )
            .await
            {
                Ok(report) => {
                    if report != SweepReport::default() {
                        tracing::info!(
                            holds_expired = report.holds_expired,
                            orders_expired = report.orders_expired,
                            grants_issued = report.grants_issued,
                            "sweep pass finished"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "sweep pass failed");
                }
            }
        }
    });
}
