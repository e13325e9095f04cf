use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    EntryKind, Hold, HoldStatus, LedgerEntry, NewEntry, Order, OrderStatus, PointPack, QuotaUsage,
    SubscriptionPlan, UserSubscription,
};

use super::{
    LedgerStore, OpScope, Reservation, SettlementOutcome, SettlementRequest, SettlementResult,
};

/// Postgres backend. Each trait call is one transaction; the wallet row is
/// locked first (`INSERT ... ON CONFLICT DO UPDATE ... RETURNING`) so that
/// operations for the same user serialize, and unique constraints enforce
/// idempotency keys across processes.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn bad_row(what: &str, value: &str) -> LedgerError {
    LedgerError::StorageUnavailable(format!("unexpected {what} in storage: {value}"))
}

fn map_entry(row: &PgRow) -> LedgerResult<LedgerEntry> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = EntryKind::parse(&kind_raw).ok_or_else(|| bad_row("ledger kind", &kind_raw))?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind,
        amount: row.try_get("amount")?,
        balance_after: row.try_get("balance_after")?,
        idempotency_key: row.try_get("idempotency_key")?,
        ref_id: row.try_get("ref_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_hold(row: &PgRow) -> LedgerResult<Hold> {
    let status_raw: String = row.try_get("status")?;
    let status =
        HoldStatus::parse(&status_raw).ok_or_else(|| bad_row("hold status", &status_raw))?;
    Ok(Hold {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        module: row.try_get("module")?,
        amount_authorized: row.try_get("amount_authorized")?,
        status,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn map_order(row: &PgRow) -> LedgerResult<Order> {
    let status_raw: String = row.try_get("status")?;
    let status =
        OrderStatus::parse(&status_raw).ok_or_else(|| bad_row("order status", &status_raw))?;
    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        pack_id: row.try_get("pack_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        status,
        provider_order_ref: row.try_get("provider_order_ref")?,
        created_at: row.try_get("created_at")?,
        paid_at: row.try_get("paid_at")?,
    })
}

/// Take the row lock for a user's wallet, creating it lazily, and return the
/// cached balance.
async fn lock_wallet(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    now: DateTime<Utc>,
) -> LedgerResult<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO point_wallets (user_id, balance, updated_at)
        VALUES ($1, 0, $2)
        ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
        RETURNING balance
        "#,
    )
    .bind(user_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    Ok(row.try_get("balance")?)
}

async fn entry_by_key(
    tx: &mut Transaction<'_, Postgres>,
    idempotency_key: &str,
) -> LedgerResult<Option<LedgerEntry>> {
    let row = sqlx::query("SELECT * FROM point_ledger WHERE idempotency_key = $1")
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;
    row.as_ref().map(map_entry).transpose()
}

/// Append one ledger row and refresh the cached balance, inside the caller's
/// transaction. The wallet row lock serializes same-user appends; the unique
/// index on `idempotency_key` backstops cross-user races.
async fn append_entry_tx(
    tx: &mut Transaction<'_, Postgres>,
    entry: &NewEntry,
    now: DateTime<Utc>,
) -> LedgerResult<LedgerEntry> {
    let balance = lock_wallet(tx, &entry.user_id, now).await?;
    if let Some(prior) = entry_by_key(tx, &entry.idempotency_key).await? {
        return Err(LedgerError::IdempotencyConflict {
            key: entry.idempotency_key.clone(),
            prior: Some(Box::new(prior)),
        });
    }

    let balance_after = balance + entry.amount;
    if balance_after < 0 {
        return Err(LedgerError::InsufficientCredits {
            required: -entry.amount,
            available: balance,
        });
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO point_ledger
            (user_id, kind, amount, balance_after, idempotency_key, ref_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(&entry.user_id)
    .bind(entry.kind.as_str())
    .bind(entry.amount)
    .bind(balance_after)
    .bind(&entry.idempotency_key)
    .bind(&entry.ref_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await;

    let row = match inserted {
        Ok(row) => row,
        Err(err) if is_unique_violation(&err) => {
            return Err(LedgerError::IdempotencyConflict {
                key: entry.idempotency_key.clone(),
                prior: None,
            });
        }
        Err(err) => return Err(err.into()),
    };

    sqlx::query("UPDATE point_wallets SET balance = $1, updated_at = $2 WHERE user_id = $3")
        .bind(balance_after)
        .bind(now)
        .bind(&entry.user_id)
        .execute(&mut *tx)
        .await?;

    map_entry(&row)
}

async fn upsert_operation_done(
    tx: &mut Transaction<'_, Postgres>,
    scope: OpScope,
    key: &str,
    outcome: &serde_json::Value,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_operations (scope, op_key, state, outcome, started_at, completed_at)
        VALUES ($1, $2, 'done', $3, $4, $4)
        ON CONFLICT (scope, op_key)
        DO UPDATE SET state = 'done', outcome = EXCLUDED.outcome, completed_at = EXCLUDED.completed_at
        "#,
    )
    .bind(scope.as_str())
    .bind(key)
    .bind(outcome)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn balance(&self, user_id: &str) -> LedgerResult<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM point_wallets WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    async fn apply_entry(&self, entry: &NewEntry) -> LedgerResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let row = append_entry_tx(&mut tx, entry, Utc::now()).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn entries(&self, user_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let rows = sqlx::query("SELECT * FROM point_ledger WHERE user_id = $1 ORDER BY id ASC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_entry).collect()
    }

    async fn rebuild_balance(&self, user_id: &str) -> LedgerResult<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        lock_wallet(&mut tx, user_id, now).await?;
        let balance: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM point_ledger WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("UPDATE point_wallets SET balance = $1, updated_at = $2 WHERE user_id = $3")
            .bind(balance)
            .bind(now)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        // The wallet row lock makes the availability check and the insert
        // atomic with respect to other holds for this user.
        let balance = lock_wallet(&mut tx, user_id, now).await?;
        let held: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_authorized), 0)::BIGINT
            FROM credit_holds
            WHERE user_id = $1 AND status = 'active'
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        let available = balance - held;
        if amount > available {
            return Err(LedgerError::InsufficientCredits {
                required: amount,
                available,
            });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO credit_holds
                (id, user_id, module, amount_authorized, status, created_at, expires_at)
            VALUES ($1, $2, $3, $4, 'active', $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(module)
        .bind(amount)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;
        let hold = map_hold(&row)?;
        tx.commit().await?;
        Ok(hold)
    }

    async fn hold(&self, hold_id: Uuid) -> LedgerResult<Option<Hold>> {
        let row = sqlx::query("SELECT * FROM credit_holds WHERE id = $1")
            .bind(hold_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_hold).transpose()
    }

    async fn consume_hold(
        &self,
        hold_id: Uuid,
        actual_amount: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<(Hold, LedgerEntry)> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM credit_holds WHERE id = $1 FOR UPDATE")
            .bind(hold_id)
            .fetch_optional(&mut *tx)
            .await?;
        let hold = match row {
            Some(row) => map_hold(&row)?,
            None => return Err(LedgerError::HoldNotFound(hold_id)),
        };

        match hold.status {
            HoldStatus::Consumed => {
                if let Some(prior) = entry_by_key(&mut tx, idempotency_key).await? {
                    return Ok((hold, prior));
                }
                return Err(LedgerError::HoldAlreadyConsumed(hold_id));
            }
            HoldStatus::Released => return Err(LedgerError::HoldReleased(hold_id)),
            HoldStatus::Expired => return Err(LedgerError::HoldExpired(hold_id)),
            HoldStatus::Active => {}
        }

        if hold.is_expired(now) {
            sqlx::query("UPDATE credit_holds SET status = 'expired' WHERE id = $1")
                .bind(hold_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Err(LedgerError::HoldExpired(hold_id));
        }
        if actual_amount > hold.amount_authorized {
            return Err(LedgerError::InvalidConsumption {
                actual: actual_amount,
                authorized: hold.amount_authorized,
            });
        }

        let entry = append_entry_tx(
            &mut tx,
            &NewEntry {
                user_id: hold.user_id.clone(),
                kind: EntryKind::Consume,
                amount: -actual_amount,
                idempotency_key: idempotency_key.to_string(),
                ref_id: Some(hold_id.to_string()),
            },
            now,
        )
        .await?;

        sqlx::query("UPDATE credit_holds SET status = 'consumed' WHERE id = $1")
            .bind(hold_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let consumed = Hold {
            status: HoldStatus::Consumed,
            ..hold
        };
        Ok((consumed, entry))
    }

    async fn release_hold(&self, hold_id: Uuid, _now: DateTime<Utc>) -> LedgerResult<Hold> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM credit_holds WHERE id = $1 FOR UPDATE")
            .bind(hold_id)
            .fetch_optional(&mut *tx)
            .await?;
        let hold = match row {
            Some(row) => map_hold(&row)?,
            None => return Err(LedgerError::HoldNotFound(hold_id)),
        };
        match hold.status {
            HoldStatus::Active => {}
            HoldStatus::Consumed => return Err(LedgerError::HoldAlreadyConsumed(hold_id)),
            HoldStatus::Released => return Err(LedgerError::HoldReleased(hold_id)),
            HoldStatus::Expired => return Err(LedgerError::HoldExpired(hold_id)),
        }
        sqlx::query("UPDATE credit_holds SET status = 'released' WHERE id = $1")
            .bind(hold_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Hold {
            status: HoldStatus::Released,
            ..hold
        })
    }

    async fn expire_holds(&self, now: DateTime<Utc>) -> LedgerResult<u64> {
        let result = sqlx::query(
            "UPDATE credit_holds SET status = 'expired' WHERE status = 'active' AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn active_hold_total(&self, user_id: &str) -> LedgerResult<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_authorized), 0)::BIGINT
            FROM credit_holds
            WHERE user_id = $1 AND status = 'active'
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn begin_operation(
        &self,
        scope: OpScope,
        key: &str,
        now: DateTime<Utc>,
        takeover: Duration,
    ) -> LedgerResult<Reservation> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT state, outcome, started_at FROM ledger_operations \
             WHERE scope = $1 AND op_key = $2 FOR UPDATE",
        )
        .bind(scope.as_str())
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            None => {
                let inserted = sqlx::query(
                    "INSERT INTO ledger_operations (scope, op_key, state, started_at) \
                     VALUES ($1, $2, 'pending', $3)",
                )
                .bind(scope.as_str())
                .bind(key)
                .bind(now)
                .execute(&mut *tx)
                .await;
                match inserted {
                    Ok(_) => {}
                    Err(err) if is_unique_violation(&err) => {
                        return Err(LedgerError::IdempotencyConflict {
                            key: key.to_string(),
                            prior: None,
                        });
                    }
                    Err(err) => return Err(err.into()),
                }
                tx.commit().await?;
                Ok(Reservation::Proceed)
            }
            Some(row) => {
                let state: String = row.try_get("state")?;
                if state == "done" {
                    let outcome: Option<serde_json::Value> = row.try_get("outcome")?;
                    return Ok(Reservation::Replay(outcome.unwrap_or(serde_json::Value::Null)));
                }
                let started_at: DateTime<Utc> = row.try_get("started_at")?;
                if now - started_at >= takeover {
                    sqlx::query(
                        "UPDATE ledger_operations SET started_at = $3 \
                         WHERE scope = $1 AND op_key = $2",
                    )
                    .bind(scope.as_str())
                    .bind(key)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        upsert_operation_done(&mut tx, scope, key, &outcome, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn abandon_operation(&self, scope: OpScope, key: &str) -> LedgerResult<()> {
        sqlx::query(
            "DELETE FROM ledger_operations WHERE scope = $1 AND op_key = $2 AND state = 'pending'",
        )
        .bind(scope.as_str())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn packs(&self) -> LedgerResult<Vec<PointPack>> {
        let packs = sqlx::query_as::<_, PointPack>(
            "SELECT * FROM point_packs WHERE active = TRUE ORDER BY points ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(packs)
    }

    async fn pack(&self, pack_id: &str) -> LedgerResult<Option<PointPack>> {
        let pack = sqlx::query_as::<_, PointPack>("SELECT * FROM point_packs WHERE id = $1")
            .bind(pack_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(pack)
    }

    async fn insert_order(&self, order: &Order) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO point_orders
                (id, user_id, pack_id, amount, currency, status, provider_order_ref, created_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(order.id)
        .bind(&order.user_id)
        .bind(&order.pack_id)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(&order.provider_order_ref)
        .bind(order.created_at)
        .bind(order.paid_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn order_by_ref(&self, provider_order_ref: &str) -> LedgerResult<Option<Order>> {
        let row = sqlx::query("SELECT * FROM point_orders WHERE provider_order_ref = $1")
            .bind(provider_order_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_order).transpose()
    }

    async fn settle_order(
        &self,
        settlement: &SettlementRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<SettlementResult> {
        let mut tx = self.pool.begin().await?;

        let op_row = sqlx::query(
            "SELECT state, outcome FROM ledger_operations \
             WHERE scope = $1 AND op_key = $2 FOR UPDATE",
        )
        .bind(OpScope::Webhook.as_str())
        .bind(&settlement.provider_txn_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(op_row) = op_row {
            let state: String = op_row.try_get("state")?;
            if state == "done" {
                let outcome: Option<serde_json::Value> = op_row.try_get("outcome")?;
                let outcome = outcome
                    .and_then(|value| serde_json::from_value(value).ok())
                    .unwrap_or(SettlementOutcome::AlreadyFinalized);
                return Ok(SettlementResult {
                    outcome,
                    replayed: true,
                });
            }
        }

        let row = sqlx::query(
            r#"
            SELECT o.id, o.user_id, o.pack_id, o.amount, o.currency, o.status,
                   o.provider_order_ref, o.created_at, o.paid_at, p.points
            FROM point_orders o
            JOIN point_packs p ON p.id = o.pack_id
            WHERE o.provider_order_ref = $1
            FOR UPDATE OF o
            "#,
        )
        .bind(&settlement.order_ref)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(LedgerError::OrderNotFound(settlement.order_ref.clone()));
        };
        let order = map_order(&row)?;
        let points: i64 = row.try_get("points")?;

        if order.status.is_terminal() {
            let outcome = SettlementOutcome::AlreadyFinalized;
            let value = serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null);
            upsert_operation_done(&mut tx, OpScope::Webhook, &settlement.provider_txn_id, &value, now)
                .await?;
            tx.commit().await?;
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

            let entry = append_entry_tx(
                &mut tx,
                &NewEntry {
                    user_id: order.user_id.clone(),
                    kind: EntryKind::Purchase,
                    amount: points,
                    idempotency_key: format!("txn:{}", settlement.provider_txn_id),
                    ref_id: Some(order.id.to_string()),
                },
                now,
            )
            .await?;

            sqlx::query("UPDATE point_orders SET status = 'paid', paid_at = $2 WHERE id = $1")
                .bind(order.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;

            SettlementOutcome::Applied {
                order_id: order.id,
                credited_points: points,
                balance_after: entry.balance_after,
            }
        } else {
            sqlx::query("UPDATE point_orders SET status = 'failed' WHERE id = $1")
                .bind(order.id)
                .execute(&mut *tx)
                .await?;
            SettlementOutcome::MarkedFailed { order_id: order.id }
        };

        let value = serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null);
        upsert_operation_done(&mut tx, OpScope::Webhook, &settlement.provider_txn_id, &value, now)
            .await?;
        tx.commit().await?;
        Ok(SettlementResult {
            outcome,
            replayed: false,
        })
    }

    async fn expire_orders(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let result = sqlx::query(
            "UPDATE point_orders SET status = 'expired' \
             WHERE status = 'pending' AND created_at <= $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn try_consume_free(
        &self,
        user_id: &str,
        module: &str,
        period: &str,
        default_cap: i64,
    ) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO quota_usage (user_id, module, period, used_count, free_cap)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (user_id, module, period) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING used_count, free_cap
            "#,
        )
        .bind(user_id)
        .bind(module)
        .bind(period)
        .bind(default_cap)
        .fetch_one(&mut *tx)
        .await?;
        let used_count: i64 = row.try_get("used_count")?;
        let free_cap: i64 = row.try_get("free_cap")?;
        if used_count >= free_cap {
            // Keep the freshly created row visible even when refusing.
            tx.commit().await?;
            return Ok(false);
        }
        sqlx::query(
            "UPDATE quota_usage SET used_count = used_count + 1 \
             WHERE user_id = $1 AND module = $2 AND period = $3",
        )
        .bind(user_id)
        .bind(module)
        .bind(period)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
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
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO quota_usage (user_id, module, period, used_count, free_cap)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (user_id, module, period) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING used_count, free_cap
            "#,
        )
        .bind(user_id)
        .bind(module)
        .bind(period)
        .bind(default_cap)
        .fetch_one(&mut *tx)
        .await?;
        let used_count: i64 = row.try_get("used_count")?;
        let free_cap: i64 = row.try_get("free_cap")?;
        if used_count >= free_cap {
            tx.commit().await?;
            return Ok(false);
        }
        sqlx::query(
            "UPDATE quota_usage SET used_count = used_count + 1 \
             WHERE user_id = $1 AND module = $2 AND period = $3",
        )
        .bind(user_id)
        .bind(module)
        .bind(period)
        .execute(&mut *tx)
        .await?;
        upsert_operation_done(&mut tx, scope, key, &outcome, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn refresh_free_caps(&self, user_id: &str, period: &str, cap: i64) -> LedgerResult<u64> {
        let result =
            sqlx::query("UPDATE quota_usage SET free_cap = $3 WHERE user_id = $1 AND period = $2")
                .bind(user_id)
                .bind(period)
                .bind(cap)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn quota_usage(
        &self,
        user_id: &str,
        module: &str,
        period: &str,
    ) -> LedgerResult<Option<QuotaUsage>> {
        let usage = sqlx::query_as::<_, QuotaUsage>(
            "SELECT * FROM quota_usage WHERE user_id = $1 AND module = $2 AND period = $3",
        )
        .bind(user_id)
        .bind(module)
        .bind(period)
        .fetch_optional(&self.pool)
        .await?;
        Ok(usage)
    }

    async fn plans(&self) -> LedgerResult<Vec<SubscriptionPlan>> {
        let plans = sqlx::query_as::<_, SubscriptionPlan>(
            "SELECT * FROM subscription_plans ORDER BY monthly_points ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    async fn subscription(
        &self,
        user_id: &str,
    ) -> LedgerResult<Option<(UserSubscription, SubscriptionPlan)>> {
        let row = sqlx::query(
            r#"
            SELECT s.user_id, s.plan_id, s.last_granted_period, s.expires_at,
                   p.id AS plan_id_row, p.name, p.monthly_points, p.batch_cap
            FROM user_subscriptions s
            JOIN subscription_plans p ON p.id = s.plan_id
            WHERE s.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let subscription = UserSubscription {
            user_id: row.try_get("user_id")?,
            plan_id: row.try_get("plan_id")?,
            last_granted_period: row.try_get("last_granted_period")?,
            expires_at: row.try_get("expires_at")?,
        };
        let plan = SubscriptionPlan {
            id: row.try_get("plan_id_row")?,
            name: row.try_get("name")?,
            monthly_points: row.try_get("monthly_points")?,
            batch_cap: row.try_get("batch_cap")?,
        };
        Ok(Some((subscription, plan)))
    }

    async fn subscribed_users(&self) -> LedgerResult<Vec<String>> {
        let users: Vec<String> = sqlx::query_scalar("SELECT user_id FROM user_subscriptions")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    async fn apply_subscription_grant(
        &self,
        user_id: &str,
        plan: &SubscriptionPlan,
        period: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEntry>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT last_granted_period FROM user_subscriptions WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let last_granted: Option<String> = row.try_get("last_granted_period")?;
        if last_granted.as_deref() == Some(period) {
            return Ok(None);
        }

        let entry = match append_entry_tx(
            &mut tx,
            &NewEntry {
                user_id: user_id.to_string(),
                kind: EntryKind::SubscriptionGrant,
                amount: plan.monthly_points,
                idempotency_key: format!("subgrant:{user_id}:{period}"),
                ref_id: Some(plan.id.to_string()),
            },
            now,
        )
        .await
        {
            Ok(entry) => entry,
            Err(LedgerError::IdempotencyConflict { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        sqlx::query("UPDATE user_subscriptions SET last_granted_period = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(period)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE quota_usage SET free_cap = $3 WHERE user_id = $1 AND period = $2")
            .bind(user_id)
            .bind(period)
            .bind(plan.batch_cap)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(entry))
    }
}
