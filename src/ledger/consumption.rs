use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::holds::AuthorizationHoldManager;
use crate::ledger::idempotency::IdempotencyGuard;
use crate::ledger::quota::QuotaPolicyEngine;
use crate::store::{OpScope, Reservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeSource {
    FreeQuota,
    Credits,
}

/// Replayable result of one charge. Stored as the operation outcome so a
/// retried request returns exactly this, whichever path it took.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeOutcome {
    pub charged: bool,
    pub source: ChargeSource,
    /// Credits debited. Zero when the free quota covered the charge.
    pub amount: i64,
    pub balance_after: Option<i64>,
}

/// Single-call charge used by module backends: try the free quota first, fall
/// through to an authorize-and-consume of paid credits. The whole call is
/// idempotent on `(user, module, request_id)`.
#[derive(Clone)]
pub struct ConsumptionProcessor {
    quota: QuotaPolicyEngine,
    holds: AuthorizationHoldManager,
    guard: IdempotencyGuard,
    hold_ttl: Duration,
}

impl ConsumptionProcessor {
    pub fn new(
        quota: QuotaPolicyEngine,
        holds: AuthorizationHoldManager,
        guard: IdempotencyGuard,
        hold_ttl_secs: i64,
    ) -> Self {
        Self {
            quota,
            holds,
            guard,
            hold_ttl: Duration::seconds(hold_ttl_secs),
        }
    }

    pub async fn charge(
        &self,
        user_id: &str,
        module: &str,
        amount: i64,
        request_id: &str,
    ) -> LedgerResult<ChargeOutcome> {
        if amount <= 0 {
            return Err(LedgerError::BadRequest(
                "charge amount must be positive".to_string(),
            ));
        }
        if request_id.trim().is_empty() {
            return Err(LedgerError::BadRequest(
                "request_id must not be empty".to_string(),
            ));
        }

        let key = format!("{user_id}:{module}:{request_id}");
        match self.guard.reserve(OpScope::Charge, &key).await? {
            Reservation::Replay(value) => {
                let outcome: ChargeOutcome = serde_json::from_value(value).map_err(|err| {
                    LedgerError::StorageUnavailable(format!("corrupt charge outcome: {err}"))
                })?;
                tracing::debug!(user_id, module, request_id, "replayed charge outcome");
                Ok(outcome)
            }
            Reservation::Proceed => {
                let free = ChargeOutcome {
                    charged: true,
                    source: ChargeSource::FreeQuota,
                    amount: 0,
                    balance_after: None,
                };
                let receipt = serde_json::to_value(&free).map_err(|err| {
                    LedgerError::StorageUnavailable(format!(
                        "unserializable charge outcome: {err}"
                    ))
                })?;
                // The free unit and the done record commit together, so a
                // crash after this point replays instead of spending again.
                let covered = match self
                    .quota
                    .charge_free(user_id, module, Utc::now(), OpScope::Charge, &key, &receipt)
                    .await
                {
                    Ok(covered) => covered,
                    Err(err) => {
                        self.abandon_claim(&key).await;
                        return Err(err);
                    }
                };
                if covered {
                    tracing::info!(user_id, module, "charge covered by free quota");
                    return Ok(free);
                }

                match self.charge_credits(user_id, module, amount, &key).await {
                    Ok(outcome) => {
                        self.guard.complete(OpScope::Charge, &key, &outcome).await?;
                        Ok(outcome)
                    }
                    Err(err) => {
                        // Domain failures leave no side effect; drop the
                        // claim so the client can retry with the same
                        // request id.
                        self.abandon_claim(&key).await;
                        Err(err)
                    }
                }
            }
        }
    }

    async fn charge_credits(
        &self,
        user_id: &str,
        module: &str,
        amount: i64,
        key: &str,
    ) -> LedgerResult<ChargeOutcome> {
        let hold = self
            .holds
            .authorize(user_id, module, amount, self.hold_ttl)
            .await?;
        // The ledger's unique idempotency key is the backstop: if a takeover
        // races the original owner, only one debit can land under `key`.
        match self.holds.consume(hold.id, amount, key).await {
            Ok((_, entry)) => Ok(ChargeOutcome {
                charged: true,
                source: ChargeSource::Credits,
                amount,
                balance_after: Some(entry.balance_after),
            }),
            Err(LedgerError::IdempotencyConflict {
                prior: Some(prior), ..
            }) => {
                // A previous owner of this key already debited before its
                // claim was taken over. Drop the duplicate hold and report
                // the original debit.
                if let Err(release_err) = self.holds.release(hold.id).await {
                    tracing::warn!(
                        hold_id = %hold.id,
                        error = %release_err,
                        "failed to release duplicate charge hold"
                    );
                }
                Ok(ChargeOutcome {
                    charged: true,
                    source: ChargeSource::Credits,
                    amount: -prior.amount,
                    balance_after: Some(prior.balance_after),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn abandon_claim(&self, key: &str) {
        if let Err(err) = self.guard.abandon(OpScope::Charge, key).await {
            tracing::warn!(key, error = %err, "failed to abandon charge reservation");
        }
    }
}
