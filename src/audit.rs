use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::LedgerResult;

/// One manual balance adjustment, recorded after the ledger entry commits.
#[derive(Debug, Clone, Serialize)]
pub struct AdminAuditEvent {
    pub id: Uuid,
    pub actor: String,
    pub target_user: String,
    pub amount: i64,
    pub reason: String,
    pub ledger_entry_id: i64,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AdminAuditEvent) -> LedgerResult<()>;
}

/// Persists audit events to `admin_audit_events`.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: &AdminAuditEvent) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_audit_events
                (id, actor, target_user, amount, reason, ledger_entry_id, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(&event.actor)
        .bind(&event.target_user)
        .bind(event.amount)
        .bind(&event.reason)
        .bind(event.ledger_entry_id)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Emits audit events as structured log lines. Used by the in-memory setup
/// where there is no audit table.
#[derive(Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AdminAuditEvent) -> LedgerResult<()> {
        tracing::info!(
            audit_id = %event.id,
            actor = %event.actor,
            target_user = %event.target_user,
            amount = event.amount,
            reason = %event.reason,
            ledger_entry_id = event.ledger_entry_id,
            "admin balance adjustment"
        );
        Ok(())
    }
}
