//! Checkout session routes.
//!
//! POST /checkout-sessions                - create a session
//! GET  /checkout-sessions/{id}           - retrieve a session
//! PUT  /checkout-sessions/{id}           - partial update
//! POST /checkout-sessions/{id}/complete  - payment, reservation, order
//! POST /checkout-sessions/{id}/cancel    - cancel

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::Value;

use crate::error::UcpError;
use crate::headers::{self, CommonHeaders, IdempotencyKey};
use crate::models::{CheckoutCreateRequest, CheckoutUpdateRequest, CompleteRequest};
use crate::services::checkout::CheckoutService;
use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/checkout-sessions", post(create_checkout))
        .route(
            "/checkout-sessions/{id}",
            get(get_checkout).put(update_checkout),
        )
        .route("/checkout-sessions/{id}/complete", post(complete_checkout))
        .route("/checkout-sessions/{id}/cancel", post(cancel_checkout))
}

async fn create_checkout(
    Extension(state): Extension<AppState>,
    common: CommonHeaders,
    IdempotencyKey(idempotency_key): IdempotencyKey,
    Json(req): Json<CheckoutCreateRequest>,
) -> Result<(StatusCode, Json<Value>), UcpError> {
    let platform = headers::discover_platform(&common.ucp_agent).await;
    let service = CheckoutService::new(&state);
    let response = service
        .create_checkout(req, &idempotency_key, platform)
        .await?;
    Ok((response.status, Json(response.body)))
}

async fn get_checkout(
    Extension(state): Extension<AppState>,
    _common: CommonHeaders,
    Path(checkout_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), UcpError> {
    let service = CheckoutService::new(&state);
    let response = service.get_checkout(&checkout_id).await?;
    Ok((response.status, Json(response.body)))
}

async fn update_checkout(
    Extension(state): Extension<AppState>,
    common: CommonHeaders,
    IdempotencyKey(idempotency_key): IdempotencyKey,
    Path(checkout_id): Path<String>,
    Json(req): Json<CheckoutUpdateRequest>,
) -> Result<(StatusCode, Json<Value>), UcpError> {
    let platform = headers::discover_platform(&common.ucp_agent).await;
    let service = CheckoutService::new(&state);
    let response = service
        .update_checkout(&checkout_id, req, &idempotency_key, platform)
        .await?;
    Ok((response.status, Json(response.body)))
}

async fn complete_checkout(
    Extension(state): Extension<AppState>,
    _common: CommonHeaders,
    IdempotencyKey(idempotency_key): IdempotencyKey,
    Path(checkout_id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<(StatusCode, Json<Value>), UcpError> {
    let service = CheckoutService::new(&state);
    let response = service
        .complete_checkout(&checkout_id, req, &idempotency_key)
        .await?;
    Ok((response.status, Json(response.body)))
}

async fn cancel_checkout(
    Extension(state): Extension<AppState>,
    _common: CommonHeaders,
    IdempotencyKey(idempotency_key): IdempotencyKey,
    Path(checkout_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), UcpError> {
    let service = CheckoutService::new(&state);
    let response = service
        .cancel_checkout(&checkout_id, &idempotency_key)
        .await?;
    Ok((response.status, Json(response.body)))
}
