//! Inbound partner webhook.
//!
//! POST /webhooks/partners/{partner_id}/events/order - order event callback

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde_json::{json, Value};

use crate::error::UcpError;
use crate::headers::RequestSignature;
use crate::models::Order;
use crate::services::checkout::CheckoutService;
use crate::AppState;

pub fn router() -> Router {
    Router::new().route(
        "/webhooks/partners/{partner_id}/events/order",
        post(order_event),
    )
}

/// Overwrites the stored order with the partner's copy, last writer wins.
/// Signature verification is presence-only in this reference implementation;
/// `test` is the development literal.
async fn order_event(
    Extension(state): Extension<AppState>,
    RequestSignature(_signature): RequestSignature,
    Path(_partner_id): Path<String>,
    Json(order): Json<Order>,
) -> Result<(StatusCode, Json<Value>), UcpError> {
    let service = CheckoutService::new(&state);
    let order_id = order.id.clone();
    service
        .update_order(&order_id, serde_json::to_value(&order)?)
        .await?;
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))))
}
