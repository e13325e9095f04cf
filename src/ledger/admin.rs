use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::audit::{AdminAuditEvent, AuditSink};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::wallet::WalletStore;
use crate::models::{EntryKind, LedgerEntry, NewEntry};

/// Manual balance corrections from the admin dashboard. Every adjustment is a
/// normal ledger entry plus an audit event naming the actor and reason.
#[derive(Clone)]
pub struct AdminAdjustmentApi {
    wallet: WalletStore,
    audit: Arc<dyn AuditSink>,
}

impl AdminAdjustmentApi {
    pub fn new(wallet: WalletStore, audit: Arc<dyn AuditSink>) -> Self {
        Self { wallet, audit }
    }

    /// Apply a signed adjustment to `user_id`'s balance. A negative amount
    /// that would take the balance below zero is rejected like any other
    /// debit.
    pub async fn adjust(
        &self,
        actor: &str,
        user_id: &str,
        amount: i64,
        reason: &str,
    ) -> LedgerResult<LedgerEntry> {
        if amount == 0 {
            return Err(LedgerError::BadRequest(
                "adjustment amount must not be zero".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(LedgerError::BadRequest(
                "adjustment reason is required".to_string(),
            ));
        }

        let entry = match self
            .wallet
            .apply_entry(&NewEntry {
                user_id: user_id.to_string(),
                kind: EntryKind::AdminAdjust,
                amount,
                idempotency_key: format!("admin:{}", Uuid::new_v4()),
                ref_id: None,
            })
            .await
        {
            Ok(entry) => entry,
            // Each adjustment gets a fresh key, so a conflict can only come
            // from a concurrent retry that already landed.
            Err(LedgerError::IdempotencyConflict {
                prior: Some(prior), ..
            }) => *prior,
            Err(err) => return Err(err),
        };

        self.audit
            .record(&AdminAuditEvent {
                id: Uuid::new_v4(),
                actor: actor.to_string(),
                target_user: user_id.to_string(),
                amount,
                reason: reason.trim().to_string(),
                ledger_entry_id: entry.id,
                occurred_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            actor,
            user_id,
            amount,
            balance_after = entry.balance_after,
            "applied admin adjustment"
        );
        Ok(entry)
    }
}
