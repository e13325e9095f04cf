use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::LedgerEntry;

/// Terminal, structured outcomes of ledger operations. Everything except
/// `StorageUnavailable` is returned to the caller as-is; transient storage
/// failures are retried at the store-adapter boundary before surfacing.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },
    #[error("hold {0} not found")]
    HoldNotFound(Uuid),
    #[error("hold {0} expired")]
    HoldExpired(Uuid),
    #[error("hold {0} already consumed")]
    HoldAlreadyConsumed(Uuid),
    #[error("hold {0} already released")]
    HoldReleased(Uuid),
    #[error("invalid consumption: actual {actual} exceeds authorized {authorized}")]
    InvalidConsumption { actual: i64, authorized: i64 },
    /// Carries the prior ledger entry (when one exists) so callers can treat
    /// a replay as success.
    #[error("idempotency conflict on key {key}")]
    IdempotencyConflict {
        key: String,
        prior: Option<Box<LedgerEntry>>,
    },
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("order {0} not found")]
    OrderNotFound(String),
    #[error(
        "settlement amount mismatch: payload {payload_amount} {payload_currency}, \
         order {order_amount} {order_currency}"
    )]
    SettlementAmountMismatch {
        payload_amount: i64,
        payload_currency: String,
        order_amount: i64,
        order_currency: String,
    },
    #[error("pack {0} not found")]
    PackNotFound(String),
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::StorageUnavailable(err.to_string())
    }
}

impl LedgerError {
    pub fn status(&self) -> StatusCode {
        match self {
            LedgerError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            LedgerError::HoldNotFound(_)
            | LedgerError::OrderNotFound(_)
            | LedgerError::PackNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::HoldExpired(_) => StatusCode::GONE,
            LedgerError::HoldAlreadyConsumed(_)
            | LedgerError::HoldReleased(_)
            | LedgerError::IdempotencyConflict { .. } => StatusCode::CONFLICT,
            LedgerError::InvalidConsumption { .. }
            | LedgerError::SettlementAmountMismatch { .. }
            | LedgerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            LedgerError::InvalidSignature => StatusCode::UNAUTHORIZED,
            LedgerError::Forbidden => StatusCode::FORBIDDEN,
            LedgerError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::warn!(?self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
