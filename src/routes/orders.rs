//! Order routes.
//!
//! GET  /orders/{id}                     - retrieve an order
//! PUT  /orders/{id}                     - replace an order
//! POST /testing/simulate-shipping/{id}  - append a shipped event (guarded
//!                                         by the Simulation-Secret header)

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{json, Value};

use crate::error::UcpError;
use crate::headers::CommonHeaders;
use crate::models::Order;
use crate::services::checkout::CheckoutService;
use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/orders/{id}", get(get_order).put(update_order))
        .route("/testing/simulate-shipping/{id}", post(simulate_shipping))
}

async fn get_order(
    Extension(state): Extension<AppState>,
    _common: CommonHeaders,
    Path(order_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), UcpError> {
    let service = CheckoutService::new(&state);
    let response = service.get_order(&order_id).await?;
    Ok((response.status, Json(response.body)))
}

async fn update_order(
    Extension(state): Extension<AppState>,
    _common: CommonHeaders,
    Path(order_id): Path<String>,
    Json(order): Json<Order>,
) -> Result<(StatusCode, Json<Value>), UcpError> {
    let service = CheckoutService::new(&state);
    let response = service
        .update_order(&order_id, serde_json::to_value(&order)?)
        .await?;
    Ok((response.status, Json(response.body)))
}

async fn simulate_shipping(
    Extension(state): Extension<AppState>,
    _common: CommonHeaders,
    headers: HeaderMap,
    Path(order_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), Response> {
    verify_simulation_secret(&headers, &state.config.simulation_secret)?;

    let service = CheckoutService::new(&state);
    service
        .ship_order(&order_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((StatusCode::OK, Json(json!({"status": "shipped"}))))
}

fn verify_simulation_secret(headers: &HeaderMap, expected: &str) -> Result<(), Response> {
    let provided = headers
        .get("simulation-secret")
        .and_then(|value| value.to_str().ok());
    if provided != Some(expected) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"detail": "Invalid Simulation Secret"})),
        )
            .into_response());
    }
    Ok(())
}
