use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{Order, OrderStatus, PointPack, SubscriptionPlan};
use crate::store::retry::{with_backoff, RetryPolicy};
use crate::store::LedgerStore;

/// Pack catalog reads and order creation. Orders are created pending and only
/// ever move by webhook settlement or the pending-order sweep.
#[derive(Clone)]
pub struct PackCatalogAndCheckout {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
}

impl PackCatalogAndCheckout {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn list_packs(&self) -> LedgerResult<Vec<PointPack>> {
        with_backoff(&self.retry, || self.store.packs()).await
    }

    pub async fn list_plans(&self) -> LedgerResult<Vec<SubscriptionPlan>> {
        with_backoff(&self.retry, || self.store.plans()).await
    }

    /// Create a pending order for `pack_id` at the pack's current price. The
    /// returned order carries the reference the payment provider will echo
    /// back in its settlement webhook.
    pub async fn create_order(&self, user_id: &str, pack_id: &str) -> LedgerResult<Order> {
        let pack = with_backoff(&self.retry, || self.store.pack(pack_id))
            .await?
            .filter(|pack| pack.active)
            .ok_or_else(|| LedgerError::PackNotFound(pack_id.to_string()))?;

        let order = Order {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            pack_id: pack.id.clone(),
            amount: pack.price_cents,
            currency: pack.currency.clone(),
            status: OrderStatus::Pending,
            provider_order_ref: format!("ord_{}", Uuid::new_v4().simple()),
            created_at: Utc::now(),
            paid_at: None,
        };
        with_backoff(&self.retry, || self.store.insert_order(&order)).await?;
        tracing::info!(
            order_id = %order.id,
            user_id,
            pack_id,
            amount = order.amount,
            currency = %order.currency,
            "created pending order"
        );
        Ok(order)
    }

    /// Packs large enough to cover `required` points, cheapest first, for the
    /// top-up hint attached to insufficient-credit responses.
    pub async fn suggest_packs(&self, required: i64) -> LedgerResult<Vec<String>> {
        let packs = self.list_packs().await?;
        Ok(packs
            .into_iter()
            .filter(|pack| pack.points >= required)
            .take(3)
            .map(|pack| pack.id)
            .collect())
    }
}
