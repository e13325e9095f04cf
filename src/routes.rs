use axum::routing::{get, patch, post};
use axum::Router;

use crate::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/points/wallet/:user_id", get(api::get_wallet))
        .route("/api/points/wallet/:user_id/ledger", get(api::get_ledger))
        .route("/api/points/holds/:hold_id", get(api::get_hold))
        .route("/api/points/packs", get(api::list_packs))
        .route("/api/plans", get(api::list_plans))
        .route("/api/points/authorize", post(api::authorize))
        .route("/api/points/consume", post(api::consume))
        .route("/api/points/release", post(api::release))
        .route("/api/points/charge", post(api::charge))
        .route("/api/points/checkout", post(api::checkout))
        .route("/webhooks/payment", post(api::payment_webhook))
        .route("/api/points/admin/adjust", patch(api::admin_adjust))
        .route("/api/points/admin/sweep", post(api::admin_sweep))
}
