use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{Extension, Router};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower::ServiceExt; // for `oneshot`

use points_backend::audit::TracingAuditSink;
use points_backend::config::EngineSettings;
use points_backend::ledger::PointsEngine;
use points_backend::models::{EntryKind, NewEntry};
use points_backend::routes::api_routes;
use points_backend::store::retry::RetryPolicy;
use points_backend::store::{LedgerStore, MemoryStore};

// key: http-tests -> routes,status-codes,admin-gate

const SECRET: &str = "test-secret";
const ADMIN_TOKEN: &str = "letmein";

fn engine() -> PointsEngine {
    let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::with_default_catalog());
    PointsEngine::new(
        store,
        Arc::new(TracingAuditSink),
        EngineSettings {
            webhook_secret: SECRET.to_string(),
            admin_token: Some(ADMIN_TOKEN.to_string()),
            default_free_cap: 2,
            charge_hold_ttl_secs: 60,
            order_pending_ttl_secs: 1800,
            idempotency_takeover_secs: 60,
            retry: RetryPolicy::default(),
        },
    )
}

fn app(engine: PointsEngine) -> Router {
    api_routes().layer(Extension(engine))
}

async fn grant(engine: &PointsEngine, user_id: &str, amount: i64) {
    engine
        .wallet()
        .apply_entry(&NewEntry {
            user_id: user_id.to_string(),
            kind: EntryKind::Grant,
            amount,
            idempotency_key: format!("seed:{user_id}"),
            ref_id: None,
        })
        .await
        .unwrap();
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn wallet_endpoint_reports_balance_and_availability() {
    let engine = engine();
    grant(&engine, "alice", 25).await;
    let response = app(engine)
        .oneshot(
            Request::builder()
                .uri("/api/points/wallet/alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["balance"], 25);
    assert_eq!(body["held"], 0);
    assert_eq!(body["available"], 25);
}

#[tokio::test]
async fn packs_endpoint_lists_catalog_in_point_order() {
    let response = app(engine())
        .oneshot(
            Request::builder()
                .uri("/api/points/packs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let packs = body["packs"].as_array().unwrap();
    assert_eq!(packs.len(), 3);
    assert_eq!(packs[0]["id"], "small");
    assert_eq!(packs[2]["points"], 3000);
}

#[tokio::test]
async fn charge_endpoint_returns_outcome() {
    let response = app(engine())
        .oneshot(post_json(
            "/api/points/charge",
            serde_json::json!({
                "user_id": "alice",
                "module": "summarize",
                "amount": 5,
                "request_id": "r1",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["charged"], true);
    assert_eq!(body["source"], "free_quota");
}

#[tokio::test]
async fn authorize_without_credits_suggests_packs() {
    let engine = engine();
    let response = app(engine)
        .oneshot(post_json(
            "/api/points/authorize",
            serde_json::json!({
                "user_id": "alice",
                "module": "summarize",
                "amount": 500,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["need_topup"], true);
    let suggested = body["suggested_pack_ids"].as_array().unwrap();
    // Packs covering 500 points, cheapest first.
    assert_eq!(suggested[0], "standard");
}

#[tokio::test]
async fn webhook_without_signature_is_unauthorized() {
    let response = app(engine())
        .oneshot(post_json(
            "/webhooks/payment",
            serde_json::json!({
                "provider_txn_id": "txn-1",
                "order_ref": "ord_x",
                "status": "success",
                "amount": 109900,
                "currency": "TWD",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_webhook_settles_checkout_order() {
    let engine = engine();
    let order = engine
        .catalog()
        .create_order("alice", "small")
        .await
        .unwrap();
    let body = serde_json::json!({
        "provider_txn_id": "txn-1",
        "order_ref": order.provider_order_ref,
        "status": "success",
        "amount": order.amount,
        "currency": order.currency,
    })
    .to_string();

    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let response = app(engine.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payment")
                .header("content-type", "application/json")
                .header("x-payment-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["replayed"], false);
    assert_eq!(body["outcome"]["result"], "applied");
    assert_eq!(engine.wallet().balance("alice").await.unwrap(), 300);
}

#[tokio::test]
async fn admin_adjust_requires_token() {
    let engine = engine();
    let request_body = serde_json::json!({
        "actor": "ops@example.com",
        "user_id": "alice",
        "amount": 50,
        "reason": "goodwill credit",
    });

    let response = app(engine.clone())
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/api/points/admin/adjust")
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(engine.clone())
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/api/points/admin/adjust")
                .header("content-type", "application/json")
                .header("x-admin-token", ADMIN_TOKEN)
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["entry"]["balance_after"], 50);
    assert_eq!(engine.wallet().balance("alice").await.unwrap(), 50);
}

#[tokio::test]
async fn admin_sweep_reports_counts() {
    let engine = engine();
    let response = app(engine)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/points/admin/sweep")
                .header("x-admin-token", ADMIN_TOKEN)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["holds_expired"], 0);
    assert_eq!(body["orders_expired"], 0);
    assert_eq!(body["grants_issued"], 0);
}

#[tokio::test]
async fn hold_endpoint_reports_status() {
    let engine = engine();
    grant(&engine, "alice", 10).await;
    let hold = engine
        .holds()
        .authorize("alice", "summarize", 5, chrono::Duration::seconds(60))
        .await
        .unwrap();

    let response = app(engine.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/api/points/holds/{}", hold.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["hold"]["status"], "active");
    assert_eq!(body["hold"]["amount_authorized"], 5);

    let response = app(engine)
        .oneshot(
            Request::builder()
                .uri(format!("/api/points/holds/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ledger_endpoint_lists_entries() {
    let engine = engine();
    grant(&engine, "alice", 25).await;
    let response = app(engine)
        .oneshot(
            Request::builder()
                .uri("/api/points/wallet/alice/ledger")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["kind"], "grant");
}
