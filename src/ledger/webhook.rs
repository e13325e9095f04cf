use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{LedgerError, LedgerResult};
use crate::store::retry::{with_backoff, RetryPolicy};
use crate::store::{LedgerStore, SettlementRequest, SettlementResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Success,
    Failure,
}

/// Body of the payment provider's settlement notification, parsed only after
/// the signature over the raw bytes verifies.
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementPayload {
    pub provider_txn_id: String,
    pub order_ref: String,
    pub status: SettlementStatus,
    pub amount: i64,
    pub currency: String,
}

/// Verifies and applies settlement webhooks. Exactly-once is keyed on the
/// provider transaction id inside the store's settlement transaction, so a
/// redelivered webhook replays the recorded outcome instead of re-crediting.
#[derive(Clone)]
pub struct PaymentWebhookProcessor {
    store: Arc<dyn LedgerStore>,
    secret: String,
    retry: RetryPolicy,
}

impl PaymentWebhookProcessor {
    pub fn new(store: Arc<dyn LedgerStore>, secret: String, retry: RetryPolicy) -> Self {
        Self {
            store,
            secret,
            retry,
        }
    }

    /// Check the hex-encoded HMAC-SHA256 signature over the raw request body.
    /// Rejection reveals nothing about which check failed.
    pub fn verify_signature(&self, body: &[u8], signature_hex: &str) -> LedgerResult<()> {
        let provided =
            hex::decode(signature_hex.trim()).map_err(|_| LedgerError::InvalidSignature)?;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| LedgerError::InvalidSignature)?;
        mac.update(body);
        mac.verify_slice(&provided)
            .map_err(|_| LedgerError::InvalidSignature)
    }

    pub fn parse_payload(&self, body: &[u8]) -> LedgerResult<SettlementPayload> {
        serde_json::from_slice(body)
            .map_err(|err| LedgerError::BadRequest(format!("malformed settlement payload: {err}")))
    }

    pub async fn handle_settlement(
        &self,
        payload: &SettlementPayload,
    ) -> LedgerResult<SettlementResult> {
        let request = SettlementRequest {
            provider_txn_id: payload.provider_txn_id.clone(),
            order_ref: payload.order_ref.clone(),
            success: payload.status == SettlementStatus::Success,
            amount: payload.amount,
            currency: payload.currency.clone(),
        };
        let result =
            with_backoff(&self.retry, || self.store.settle_order(&request, Utc::now())).await?;
        tracing::info!(
            provider_txn_id = %payload.provider_txn_id,
            order_ref = %payload.order_ref,
            replayed = result.replayed,
            outcome = ?result.outcome,
            "processed settlement webhook"
        );
        Ok(result)
    }
}
