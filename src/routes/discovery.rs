//! Discovery route.
//!
//! GET /.well-known/ucp - the merchant profile and capability document

use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::Value;

use crate::config;
use crate::error::UcpError;
use crate::AppState;

pub fn router() -> Router {
    Router::new().route("/.well-known/ucp", get(merchant_profile))
}

/// Serves the embedded profile template with `{{ENDPOINT}}` and
/// `{{SHOP_ID}}` substituted for this instance.
async fn merchant_profile(
    Extension(state): Extension<AppState>,
) -> Result<Json<Value>, UcpError> {
    let profile = config::PROFILE_TEMPLATE
        .replace("{{ENDPOINT}}", &state.config.base_url)
        .replace("{{SHOP_ID}}", &state.config.shop_id);
    Ok(Json(serde_json::from_str(&profile)?))
}
