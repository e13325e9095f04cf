use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    EntryKind, Hold, HoldStatus, LedgerEntry, NewEntry, Order, OrderStatus, PointPack, QuotaUsage,
    SubscriptionPlan, UserSubscription, Wallet,
};

use super::{
    LedgerStore, OpScope, Reservation, SettlementOutcome, SettlementRequest, SettlementResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Pending,
    Done,
}

#[derive(Debug, Clone)]
struct OperationRecord {
    state: OpState,
    outcome: Option<serde_json::Value>,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    wallets: HashMap<String, Wallet>,
    ledger: Vec<LedgerEntry>,
    holds: HashMap<Uuid, Hold>,
    operations: HashMap<(&'static str, String), OperationRecord>,
    packs: Vec<PointPack>,
    orders: HashMap<Uuid, Order>,
    plans: Vec<SubscriptionPlan>,
    subscriptions: HashMap<String, UserSubscription>,
    quota: HashMap<(String, String, String), QuotaUsage>,
    next_entry_id: i64,
}

/// Whole-state-behind-one-mutex backend. Every trait call holds the lock for
/// its full duration, which makes each operation trivially atomic and the
/// interleaving of operations serializable. Used by the test suite and for
/// local development without Postgres.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with the catalog the migrations install.
    pub fn with_default_catalog() -> Self {
        let store = Self::new();
        {
            let mut state = store.state.try_lock().expect("fresh store is uncontended");
            state.packs = vec![
                pack("small", "Small Pack", 300, 39900),
                pack("standard", "Standard Pack", 1000, 109900),
                pack("large", "Large Pack", 3000, 339900),
            ];
        }
        store
    }

    pub async fn seed_packs(&self, packs: Vec<PointPack>) {
        self.state.lock().await.packs = packs;
    }

    pub async fn seed_plans(&self, plans: Vec<SubscriptionPlan>) {
        self.state.lock().await.plans = plans;
    }

    pub async fn upsert_subscription(&self, subscription: UserSubscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.user_id.clone(), subscription);
    }
}

fn pack(id: &str, name: &str, points: i64, price_cents: i64) -> PointPack {
    PointPack {
        id: id.to_string(),
        name: name.to_string(),
        points,
        price_cents,
        currency: "TWD".to_string(),
        active: true,
    }
}

fn balance_of(state: &MemoryState, user_id: &str) -> i64 {
    state
        .wallets
        .get(user_id)
        .map(|wallet| wallet.balance)
        .unwrap_or(0)
}

fn active_hold_total_of(state: &MemoryState, user_id: &str) -> i64 {
    state
        .holds
        .values()
        .filter(|hold| hold.user_id == user_id && hold.status == HoldStatus::Active)
        .map(|hold| hold.amount_authorized)
        .sum()
}

/// Append one row and refresh the cached balance. The single-mutex design
/// makes the uniqueness check and the floor check atomic with the append.
fn append_entry(
    state: &mut MemoryState,
    entry: &NewEntry,
    now: DateTime<Utc>,
) -> LedgerResult<LedgerEntry> {
    if let Some(prior) = state
        .ledger
        .iter()
        .find(|row| row.idempotency_key == entry.idempotency_key)
    {
        return Err(LedgerError::IdempotencyConflict {
            key: entry.idempotency_key.clone(),
            prior: Some(Box::new(prior.clone())),
        });
    }

    let balance = balance_of(state, &entry.user_id);
    let balance_after = balance + entry.amount;
    if balance_after < 0 {
        return Err(LedgerError::InsufficientCredits {
            required: -entry.amount,
            available: balance,
        });
    }

    state.next_entry_id += 1;
    let row = LedgerEntry {
        id: state.next_entry_id,
        user_id: entry.user_id.clone(),
        kind: entry.kind,
        amount: entry.amount,
        balance_after,
        idempotency_key: entry.idempotency_key.clone(),
        ref_id: entry.ref_id.clone(),
        created_at: now,
    };
    state.ledger.push(row.clone());
    state.wallets.insert(
        entry.user_id.clone(),
        Wallet {
            user_id: entry.user_id.clone(),
            balance: balance_after,
            updated_at: now,
        },
    );
    Ok(row)
}

fn record_done(
    state: &mut MemoryState,
    scope: OpScope,
    key: &str,
    outcome: serde_json::Value,
    now: DateTime<Utc>,
) {
    state.operations.insert(
        (scope.as_str(), key.to_string()),
        OperationRecord {
            state: OpState::Done,
            outcome: Some(outcome),
            started_at: now,
        },
    );
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn balance(&self, user_id: &str) -> LedgerResult<i64> {
        let state = self.state.lock().await;
        Ok(balance_of(&state, user_id))
    }

    async fn apply_entry(&self, entry: &NewEntry) -> LedgerResult<LedgerEntry> {
        let mut state = self.state.lock().await;
        append_entry(&mut state, entry, Utc::now())
    }

    async fn entries(&self, user_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn rebuild_balance(&self, user_id: &str) -> LedgerResult<i64> {
        let mut state = self.state.lock().await;
        let balance: i64 = state
            .ledger
            .iter()
            .filter(|row| row.user_id == user_id)
            .map(|row| row.amount)
            .sum();
        state.wallets.insert(
            user_id.to_string(),
            Wallet {
                user_id: user_id.to_string(),
                balance,
                updated_at: Utc::now(),
            },
        );
        Ok(balance)
    }

    async fn insert_hold(
        &self,
        user_id: &str,
        module: &str,
        amount: i64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> LedgerResult<Hold> {
        let mut state = self.state.lock().await;
        let available = balance_of(&state, user_id) - active_hold_total_of(&state, user_id);
        if amount > available {
            return Err(LedgerError::InsufficientCredits {
                required: amount,
                available,
            });
        }
        let hold = Hold {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            module: module.to_string(),
            amount_authorized: amount,
            status: HoldStatus::Active,
            created_at: now,
            expires_at,
        };
        state.holds.insert(hold.id, hold.clone());
        Ok(hold)
    }

    async fn hold(&self, hold_id: Uuid) -> LedgerResult<Option<Hold>> {
        let state = self.state.lock().await;
        Ok(state.holds.get(&hold_id).cloned())
    }

    async fn consume_hold(
        &self,
        hold_id: Uuid,
        actual_amount: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<(Hold, LedgerEntry)> {
        let mut state = self.state.lock().await;
        let hold = state
            .holds
            .get(&hold_id)
            .cloned()
            .ok_or(LedgerError::HoldNotFound(hold_id))?;

        match hold.status {
            HoldStatus::Consumed => {
                // Replay: the debit already happened under this key.
                if let Some(prior) = state
                    .ledger
                    .iter()
                    .find(|row| row.idempotency_key == idempotency_key)
                {
                    return Ok((hold, prior.clone()));
                }
                return Err(LedgerError::HoldAlreadyConsumed(hold_id));
            }
            HoldStatus::Released => return Err(LedgerError::HoldReleased(hold_id)),
            HoldStatus::Expired => return Err(LedgerError::HoldExpired(hold_id)),
            HoldStatus::Active => {}
        }

        if hold.is_expired(now) {
            if let Some(stored) = state.holds.get_mut(&hold_id) {
                stored.status = HoldStatus::Expired;
            }
            return Err(LedgerError::HoldExpired(hold_id));
        }
        if actual_amount > hold.amount_authorized {
            return Err(LedgerError::InvalidConsumption {
                actual: actual_amount,
                authorized: hold.amount_authorized,
            });
        }

        let entry = append_entry(
            &mut state,
            &NewEntry {
                user_id: hold.user_id.clone(),
                kind: EntryKind::Consume,
                amount: -actual_amount,
                idempotency_key: idempotency_key.to_string(),
                ref_id: Some(hold_id.to_string()),
            },
            now,
        )?;

        let stored = state
            .holds
            .get_mut(&hold_id)
            .ok_or(LedgerError::HoldNotFound(hold_id))?;
        stored.status = HoldStatus::Consumed;
        let consumed = stored.clone();
        Ok((consumed, entry))
    }

    async fn release_hold(&self, hold_id: Uuid, _now: DateTime<Utc>) -> LedgerResult<Hold> {
        let mut state = self.state.lock().await;
        let hold = state
            .holds
            .get_mut(&hold_id)
            .ok_or(LedgerError::HoldNotFound(hold_id))?;
        match hold.status {
            HoldStatus::Active => {
                hold.status = HoldStatus::Released;
                Ok(hold.clone())
            }
            HoldStatus::Consumed => Err(LedgerError::HoldAlreadyConsumed(hold_id)),
            HoldStatus::Released => Err(LedgerError::HoldReleased(hold_id)),
            HoldStatus::Expired => Err(LedgerError::HoldExpired(hold_id)),
        }
    }

    async fn expire_holds(&self, now: DateTime<Utc>) -> LedgerResult<u64> {
        let mut state = self.state.lock().await;
        let mut swept = 0;
        for hold in state.holds.values_mut() {
            if hold.status == HoldStatus::Active && now > hold.expires_at {
                hold.status = HoldStatus::Expired;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn active_hold_total(&self, user_id: &str) -> LedgerResult<i64> {
        let state = self.state.lock().await;
        Ok(active_hold_total_of(&state, user_id))
    }

    async fn begin_operation(
        &self,
        scope: OpScope,
        key: &str,
        now: DateTime<Utc>,
        takeover: Duration,
    ) -> LedgerResult<Reservation> {
        let mut state = self.state.lock().await;
        match state.operations.get_mut(&(scope.as_str(), key.to_string())) {
            None => {
                state.operations.insert(
                    (scope.as_str(), key.to_string()),
                    OperationRecord {
                        state: OpState::Pending,
                        outcome: None,
                        started_at: now,
                    },
                );
                Ok(Reservation::Proceed)
            }
            Some(record) if record.state == OpState::Done => Ok(Reservation::Replay(
                record.outcome.clone().unwrap_or(serde_json::Value::Null),
            )),
            Some(record) => {
                if now - record.started_at >= takeover {
                    record.started_at = now;
                    Ok(Reservation::Proceed)
                } else {
                    Err(LedgerError::IdempotencyConflict {
                        key: key.to_string(),
                        prior: None,
                    })
                }
            }
        }
    }

    async fn complete_operation(
        &self,
        scope: OpScope,
        key: &str,
        outcome: serde_json::Value,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        record_done(&mut state, scope, key, outcome, now);
        Ok(())
    }

    async fn abandon_operation(&self, scope: OpScope, key: &str) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let slot = (scope.as_str(), key.to_string());
        if let Some(record) = state.operations.get(&slot) {
            if record.state == OpState::Pending {
                state.operations.remove(&slot);
            }
        }
        Ok(())
    }

    async fn packs(&self) -> LedgerResult<Vec<PointPack>> {
        let state = self.state.lock().await;
        let mut packs: Vec<PointPack> = state
            .packs
            .iter()
            .filter(|pack| pack.active)
            .cloned()
            .collect();
        packs.sort_by_key(|pack| pack.points);
        Ok(packs)
    }

    async fn pack(&self, pack_id: &str) -> LedgerResult<Option<PointPack>> {
        let state = self.state.lock().await;
        Ok(state.packs.iter().find(|pack| pack.id == pack_id).cloned())
    }

    async fn insert_order(&self, order: &Order) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn order_by_ref(&self, provider_order_ref: &str) -> LedgerResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|order| order.provider_order_ref == provider_order_ref)
            .cloned())
    }

    async fn settle_order(
        &self,
        settlement: &SettlementRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<SettlementResult> {
        let mut state = self.state.lock().await;

        let op_slot = (
            OpScope::Webhook.as_str(),
            settlement.provider_txn_id.clone(),
        );
        if let Some(record) = state.operations.get(&op_slot) {
            if record.state == OpState::Done {
                let outcome = record
                    .outcome
                    .clone()
                    .and_then(|value| serde_json::from_value(value).ok())
                    .unwrap_or(SettlementOutcome::AlreadyFinalized);
                return Ok(SettlementResult {
                    outcome,
                    replayed: true,
                });
            }
        }

        let order = state
            .orders
            .values()
            .find(|order| order.provider_order_ref == settlement.order_ref)
            .cloned()
            .ok_or_else(|| LedgerError::OrderNotFound(settlement.order_ref.clone()))?;

        if order.status.is_terminal() {
            let outcome = SettlementOutcome::AlreadyFinalized;
            record_done(
                &mut state,
                OpScope::Webhook,
                &settlement.provider_txn_id,
                serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null),
                now,
            );
            return Ok(SettlementResult {
                outcome,
                replayed: false,
            });
        }

        let outcome = if settlement.success {
            if settlement.amount != order.amount
                || !settlement.currency.eq_ignore_ascii_case(&order.currency)
            {
                return Err(LedgerError::SettlementAmountMismatch {
                    payload_amount: settlement.amount,
                    payload_currency: settlement.currency.clone(),
                    order_amount: order.amount,
                    order_currency: order.currency.clone(),
                });
            }
            let points = state
                .packs
                .iter()
                .find(|pack| pack.id == order.pack_id)
                .map(|pack| pack.points)
                .ok_or_else(|| LedgerError::PackNotFound(order.pack_id.clone()))?;

            let entry = append_entry(
                &mut state,
                &NewEntry {
                    user_id: order.user_id.clone(),
                    kind: EntryKind::Purchase,
                    amount: points,
                    idempotency_key: format!("txn:{}", settlement.provider_txn_id),
                    ref_id: Some(order.id.to_string()),
                },
                now,
            )?;

            let stored = state
                .orders
                .get_mut(&order.id)
                .ok_or_else(|| LedgerError::OrderNotFound(settlement.order_ref.clone()))?;
            stored.status = OrderStatus::Paid;
            stored.paid_at = Some(now);

            SettlementOutcome::Applied {
                order_id: order.id,
                credited_points: points,
                balance_after: entry.balance_after,
            }
        } else {
            let stored = state
                .orders
                .get_mut(&order.id)
                .ok_or_else(|| LedgerError::OrderNotFound(settlement.order_ref.clone()))?;
            stored.status = OrderStatus::Failed;
            SettlementOutcome::MarkedFailed { order_id: order.id }
        };

        record_done(
            &mut state,
            OpScope::Webhook,
            &settlement.provider_txn_id,
            serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null),
            now,
        );
        Ok(SettlementResult {
            outcome,
            replayed: false,
        })
    }

    async fn expire_orders(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let mut state = self.state.lock().await;
        let mut swept = 0;
        for order in state.orders.values_mut() {
            if order.status == OrderStatus::Pending && order.created_at <= cutoff {
                order.status = OrderStatus::Expired;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn try_consume_free(
        &self,
        user_id: &str,
        module: &str,
        period: &str,
        default_cap: i64,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let usage = state
            .quota
            .entry((
                user_id.to_string(),
                module.to_string(),
                period.to_string(),
            ))
            .or_insert_with(|| QuotaUsage {
                user_id: user_id.to_string(),
                module: module.to_string(),
                period: period.to_string(),
                used_count: 0,
                free_cap: default_cap,
            });
        if usage.used_count < usage.free_cap {
            usage.used_count += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

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
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let usage = state
            .quota
            .entry((
                user_id.to_string(),
                module.to_string(),
                period.to_string(),
            ))
            .or_insert_with(|| QuotaUsage {
                user_id: user_id.to_string(),
                module: module.to_string(),
                period: period.to_string(),
                used_count: 0,
                free_cap: default_cap,
            });
        if usage.used_count >= usage.free_cap {
            return Ok(false);
        }
        usage.used_count += 1;
        record_done(&mut state, scope, key, outcome, now);
        Ok(true)
    }

    async fn refresh_free_caps(&self, user_id: &str, period: &str, cap: i64) -> LedgerResult<u64> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for ((user, _module, row_period), usage) in state.quota.iter_mut() {
            if user == user_id && row_period == period {
                usage.free_cap = cap;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn quota_usage(
        &self,
        user_id: &str,
        module: &str,
        period: &str,
    ) -> LedgerResult<Option<QuotaUsage>> {
        let state = self.state.lock().await;
        Ok(state
            .quota
            .get(&(
                user_id.to_string(),
                module.to_string(),
                period.to_string(),
            ))
            .cloned())
    }

    async fn plans(&self) -> LedgerResult<Vec<SubscriptionPlan>> {
        let state = self.state.lock().await;
        let mut plans = state.plans.clone();
        plans.sort_by_key(|plan| plan.monthly_points);
        Ok(plans)
    }

    async fn subscription(
        &self,
        user_id: &str,
    ) -> LedgerResult<Option<(UserSubscription, SubscriptionPlan)>> {
        let state = self.state.lock().await;
        let Some(subscription) = state.subscriptions.get(user_id) else {
            return Ok(None);
        };
        let Some(plan) = state
            .plans
            .iter()
            .find(|plan| plan.id == subscription.plan_id)
        else {
            return Ok(None);
        };
        Ok(Some((subscription.clone(), plan.clone())))
    }

    async fn subscribed_users(&self) -> LedgerResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.keys().cloned().collect())
    }

    async fn apply_subscription_grant(
        &self,
        user_id: &str,
        plan: &SubscriptionPlan,
        period: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEntry>> {
        let mut state = self.state.lock().await;
        let already_granted = state
            .subscriptions
            .get(user_id)
            .map(|sub| sub.last_granted_period.as_deref() == Some(period))
            .unwrap_or(true);
        if already_granted {
            return Ok(None);
        }

        let entry = match append_entry(
            &mut state,
            &NewEntry {
                user_id: user_id.to_string(),
                kind: EntryKind::SubscriptionGrant,
                amount: plan.monthly_points,
                idempotency_key: format!("subgrant:{user_id}:{period}"),
                ref_id: Some(plan.id.to_string()),
            },
            now,
        ) {
            Ok(entry) => entry,
            // Another worker granted this period between our check and append.
            Err(LedgerError::IdempotencyConflict { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        if let Some(subscription) = state.subscriptions.get_mut(user_id) {
            subscription.last_granted_period = Some(period.to_string());
        }
        for ((user, _module, row_period), usage) in state.quota.iter_mut() {
            if user == user_id && row_period == period {
                usage.free_cap = plan.batch_cap;
            }
        }
        Ok(Some(entry))
    }
}
