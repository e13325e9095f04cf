use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::models::{
    Hold, LedgerEntry, NewEntry, Order, PointPack, QuotaUsage, SubscriptionPlan, UserSubscription,
};

pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Namespace for idempotent-operation records. A key is unique within its
/// scope, not globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpScope {
    Charge,
    Webhook,
}

impl OpScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpScope::Charge => "charge",
            OpScope::Webhook => "webhook",
        }
    }
}

/// Result of reserving an idempotency key.
#[derive(Debug, Clone)]
pub enum Reservation {
    /// The key is new (or its previous placeholder was abandoned); the caller
    /// owns the side effect.
    Proceed,
    /// The operation already completed; the recorded outcome is returned
    /// instead of re-executing.
    Replay(serde_json::Value),
}

/// Parsed, verified settlement notification handed to the store.
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub provider_txn_id: String,
    pub order_ref: String,
    pub success: bool,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Applied {
        order_id: Uuid,
        credited_points: i64,
        balance_after: i64,
    },
    MarkedFailed {
        order_id: Uuid,
    },
    /// The order had already left `pending` when this transaction arrived.
    AlreadyFinalized,
}

#[derive(Debug, Clone)]
pub struct SettlementResult {
    pub outcome: SettlementOutcome,
    /// True when the provider transaction id had already been processed and
    /// the stored outcome was returned without re-applying.
    pub replayed: bool,
}

/// The transactional seam under the ledger. Every method is one atomic unit:
/// either all of its reads-then-writes commit, or none do, and concurrent
/// calls touching the same user serialize. `MemoryStore` serializes behind a
/// single async mutex; `PgStore` uses per-call transactions with row locks
/// and unique constraints.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Wallet and ledger.

    async fn balance(&self, user_id: &str) -> LedgerResult<i64>;

    /// Append one ledger row and update the cached balance. Fails with
    /// `IdempotencyConflict { prior }` when the key was already used and with
    /// `InsufficientCredits` when a debit would push the balance below zero.
    async fn apply_entry(&self, entry: &NewEntry) -> LedgerResult<LedgerEntry>;

    async fn entries(&self, user_id: &str) -> LedgerResult<Vec<LedgerEntry>>;

    /// Recompute the cached balance from the ledger and persist it.
    async fn rebuild_balance(&self, user_id: &str) -> LedgerResult<i64>;

    // Holds.

    /// Check `balance - sum(active holds) >= amount` and insert an active
    /// hold, atomically with respect to other holds for the same user.
    async fn insert_hold(
        &self,
        user_id: &str,
        module: &str,
        amount: i64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> LedgerResult<Hold>;

    async fn hold(&self, hold_id: Uuid) -> LedgerResult<Option<Hold>>;

    /// Re-validate the hold (state, expiry, authorized amount), debit
    /// `actual_amount` and mark the hold consumed, all in one transaction.
    /// A replay with the same idempotency key returns the original entry.
    async fn consume_hold(
        &self,
        hold_id: Uuid,
        actual_amount: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<(Hold, LedgerEntry)>;

    async fn release_hold(&self, hold_id: Uuid, now: DateTime<Utc>) -> LedgerResult<Hold>;

    /// Advisory sweep: mark active holds past `expires_at` as expired.
    async fn expire_holds(&self, now: DateTime<Utc>) -> LedgerResult<u64>;

    async fn active_hold_total(&self, user_id: &str) -> LedgerResult<i64>;

    // Idempotent operations.

    /// Insert a pending placeholder for `(scope, key)` or report the prior
    /// outcome. A pending placeholder older than `takeover` counts as
    /// abandoned and is taken over; a younger one yields
    /// `IdempotencyConflict` with no prior outcome.
    async fn begin_operation(
        &self,
        scope: OpScope,
        key: &str,
        now: DateTime<Utc>,
        takeover: Duration,
    ) -> LedgerResult<Reservation>;

    async fn complete_operation(
        &self,
        scope: OpScope,
        key: &str,
        outcome: serde_json::Value,
        now: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Drop a pending placeholder so a later retry can run the operation.
    async fn abandon_operation(&self, scope: OpScope, key: &str) -> LedgerResult<()>;

    // Packs and orders.

    async fn packs(&self) -> LedgerResult<Vec<PointPack>>;

    async fn pack(&self, pack_id: &str) -> LedgerResult<Option<PointPack>>;

    async fn insert_order(&self, order: &Order) -> LedgerResult<()>;

    async fn order_by_ref(&self, provider_order_ref: &str) -> LedgerResult<Option<Order>>;

    /// Apply one settlement exactly once: idempotency on the provider
    /// transaction id, order-status transition, and the purchase credit are
    /// a single transaction. See `PaymentWebhookProcessor`.
    async fn settle_order(
        &self,
        settlement: &SettlementRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<SettlementResult>;

    /// Sweep pending orders created at or before `cutoff` to expired.
    async fn expire_orders(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64>;

    // Free quota.

    /// If `used_count < free_cap` for `(user, module, period)`, increment the
    /// counter and return true. A missing row is created with
    /// `free_cap = default_cap`.
    async fn try_consume_free(
        &self,
        user_id: &str,
        module: &str,
        period: &str,
        default_cap: i64,
    ) -> LedgerResult<bool>;

    /// Take one free unit and mark the operation `(scope, key)` done with
    /// `outcome`, as a single atomic unit. A worker crashing between the two
    /// could otherwise burn a second free unit when the claim is taken over.
    /// Returns false (still creating the quota row) when the cap is
    /// exhausted.
    #[allow(clippy::too_many_arguments)]
    async fn charge_free(
        &self,
        scope: OpScope,
        key: &str,
        user_id: &str,
        module: &str,
        period: &str,
        default_cap: i64,
        outcome: serde_json::Value,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool>;

    /// Update `free_cap` on the user's existing quota rows for `period`.
    async fn refresh_free_caps(&self, user_id: &str, period: &str, cap: i64) -> LedgerResult<u64>;

    async fn quota_usage(
        &self,
        user_id: &str,
        module: &str,
        period: &str,
    ) -> LedgerResult<Option<QuotaUsage>>;

    // Subscriptions and plans.

    async fn plans(&self) -> LedgerResult<Vec<SubscriptionPlan>>;

    async fn subscription(
        &self,
        user_id: &str,
    ) -> LedgerResult<Option<(UserSubscription, SubscriptionPlan)>>;

    async fn subscribed_users(&self) -> LedgerResult<Vec<String>>;

    /// Credit `monthly_points`, advance `last_granted_period` and refresh the
    /// user's quota caps, atomically. Returns `None` when the period was
    /// already granted (re-invocation within a period is a no-op).
    async fn apply_subscription_grant(
        &self,
        user_id: &str,
        plan: &SubscriptionPlan,
        period: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEntry>>;
}
