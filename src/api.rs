use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::sweeper;
use crate::ledger::PointsEngine;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const SIGNATURE_HEADER: &str = "x-payment-signature";

pub async fn get_wallet(
    Extension(engine): Extension<PointsEngine>,
    Path(user_id): Path<String>,
) -> LedgerResult<Json<serde_json::Value>> {
    let balance = engine.wallet().balance(&user_id).await?;
    let held = engine.store().active_hold_total(&user_id).await?;
    Ok(Json(json!({
        "user_id": user_id,
        "balance": balance,
        "held": held,
        "available": balance - held,
    })))
}

pub async fn get_ledger(
    Extension(engine): Extension<PointsEngine>,
    Path(user_id): Path<String>,
) -> LedgerResult<Json<serde_json::Value>> {
    let entries = engine.wallet().entries(&user_id).await?;
    Ok(Json(json!({ "user_id": user_id, "entries": entries })))
}

pub async fn get_hold(
    Extension(engine): Extension<PointsEngine>,
    Path(hold_id): Path<Uuid>,
) -> LedgerResult<Json<serde_json::Value>> {
    let hold = engine.holds().get(hold_id).await?;
    Ok(Json(json!({ "hold": hold })))
}

pub async fn list_packs(
    Extension(engine): Extension<PointsEngine>,
) -> LedgerResult<Json<serde_json::Value>> {
    let packs = engine.catalog().list_packs().await?;
    Ok(Json(json!({ "packs": packs })))
}

pub async fn list_plans(
    Extension(engine): Extension<PointsEngine>,
) -> LedgerResult<Json<serde_json::Value>> {
    let plans = engine.catalog().list_plans().await?;
    Ok(Json(json!({ "plans": plans })))
}

pub async fn authorize(
    Extension(engine): Extension<PointsEngine>,
    Json(request): Json<AuthorizeRequest>,
) -> Result<Response, LedgerError> {
    let ttl = Duration::seconds(
        request
            .ttl_secs
            .unwrap_or(engine.settings().charge_hold_ttl_secs),
    );
    match engine
        .holds()
        .authorize(&request.user_id, &request.module, request.amount, ttl)
        .await
    {
        Ok(hold) => Ok(Json(json!({
            "hold_id": hold.id,
            "expires_at": hold.expires_at,
            "hold": hold,
        }))
        .into_response()),
        Err(LedgerError::InsufficientCredits {
            required,
            available,
        }) => Ok(insufficient_response(&engine, required, available).await),
        Err(err) => Err(err),
    }
}

pub async fn consume(
    Extension(engine): Extension<PointsEngine>,
    Json(request): Json<ConsumeRequest>,
) -> LedgerResult<Json<serde_json::Value>> {
    let (hold, entry) = engine
        .holds()
        .consume(
            request.hold_id,
            request.actual_amount,
            &request.idempotency_key,
        )
        .await?;
    Ok(Json(json!({
        "balance_after": entry.balance_after,
        "hold": hold,
        "entry": entry,
    })))
}

pub async fn release(
    Extension(engine): Extension<PointsEngine>,
    Json(request): Json<ReleaseRequest>,
) -> LedgerResult<Json<serde_json::Value>> {
    let hold = engine.holds().release(request.hold_id).await?;
    Ok(Json(json!({ "released": true, "hold": hold })))
}

pub async fn charge(
    Extension(engine): Extension<PointsEngine>,
    Json(request): Json<ChargeRequest>,
) -> Result<Response, LedgerError> {
    match engine
        .charges()
        .charge(
            &request.user_id,
            &request.module,
            request.amount,
            &request.request_id,
        )
        .await
    {
        Ok(outcome) => Ok(Json(outcome).into_response()),
        Err(LedgerError::InsufficientCredits {
            required,
            available,
        }) => Ok(insufficient_response(&engine, required, available).await),
        Err(err) => Err(err),
    }
}

pub async fn checkout(
    Extension(engine): Extension<PointsEngine>,
    Json(request): Json<CheckoutRequest>,
) -> LedgerResult<Json<serde_json::Value>> {
    let order = engine
        .catalog()
        .create_order(&request.user_id, &request.pack_id)
        .await?;
    let points = engine
        .store()
        .pack(&order.pack_id)
        .await?
        .map(|pack| pack.points);
    Ok(Json(json!({
        "order_id": order.id,
        "checkout_ref": order.provider_order_ref,
        "amount": order.amount,
        "currency": order.currency,
        "points": points,
        "order": order,
    })))
}

/// Settlement notifications from the payment provider. The signature covers
/// the raw body; parsing happens only after it verifies.
pub async fn payment_webhook(
    Extension(engine): Extension<PointsEngine>,
    headers: HeaderMap,
    body: Bytes,
) -> LedgerResult<Json<serde_json::Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(LedgerError::InvalidSignature)?;
    engine.webhooks().verify_signature(&body, signature)?;
    let payload = engine.webhooks().parse_payload(&body)?;
    let result = engine.webhooks().handle_settlement(&payload).await?;
    Ok(Json(json!({
        "replayed": result.replayed,
        "outcome": result.outcome,
    })))
}

pub async fn admin_adjust(
    Extension(engine): Extension<PointsEngine>,
    headers: HeaderMap,
    Json(request): Json<AdminAdjustRequest>,
) -> LedgerResult<Json<serde_json::Value>> {
    require_admin(&engine, &headers)?;
    let entry = engine
        .admin()
        .adjust(
            &request.actor,
            &request.user_id,
            request.amount,
            &request.reason,
        )
        .await?;
    Ok(Json(json!({ "entry": entry })))
}

pub async fn admin_sweep(
    Extension(engine): Extension<PointsEngine>,
    headers: HeaderMap,
) -> LedgerResult<Json<serde_json::Value>> {
    require_admin(&engine, &headers)?;
    let report = sweeper::process_tick(
        engine.store(),
        engine.subscriptions(),
        engine.settings().order_pending_ttl_secs,
        chrono::Utc::now(),
    )
    .await
    .map_err(|err| LedgerError::StorageUnavailable(err.to_string()))?;
    Ok(Json(json!({
        "holds_expired": report.holds_expired,
        "orders_expired": report.orders_expired,
        "grants_issued": report.grants_issued,
    })))
}

/// Admin endpoints fail closed: no configured token means no access.
fn require_admin(engine: &PointsEngine, headers: &HeaderMap) -> LedgerResult<()> {
    let Some(expected) = engine.settings().admin_token.as_deref() else {
        return Err(LedgerError::Forbidden);
    };
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(LedgerError::Forbidden)
    }
}

async fn insufficient_response(engine: &PointsEngine, required: i64, available: i64) -> Response {
    let suggested = engine
        .catalog()
        .suggest_packs(required)
        .await
        .unwrap_or_default();
    (
        StatusCode::PAYMENT_REQUIRED,
        Json(json!({
            "error": "insufficient credits",
            "required": required,
            "available": available,
            "need_topup": true,
            "suggested_pack_ids": suggested,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub user_id: String,
    pub module: String,
    pub amount: i64,
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub hold_id: Uuid,
    pub actual_amount: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub hold_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ChargeRequest {
    pub user_id: String,
    pub module: String,
    pub amount: i64,
    pub request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: String,
    pub pack_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminAdjustRequest {
    pub actor: String,
    pub user_id: String,
    pub amount: i64,
    pub reason: String,
}
