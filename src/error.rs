//! Domain errors for the UCP merchant server.
//!
//! Every business-rule violation maps to a stable error code and HTTP status,
//! serialized as the `{detail, code}` envelope the protocol prescribes.
//! Persistence and serialization failures are folded in so handlers can use
//! `?` throughout; they surface as 500 INTERNAL_ERROR.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UcpError {
    #[error("{0}")]
    ResourceNotFound(String),

    #[error("{0}")]
    InvalidRequest(String),

    /// `conflict` is true when raised from the atomic reserve path of
    /// complete, where the failure is authoritative rather than advisory.
    #[error("{message}")]
    OutOfStock { message: String, conflict: bool },

    #[error("{message}")]
    PaymentFailed {
        message: String,
        code: &'static str,
        status: StatusCode,
    },

    #[error("{0}")]
    IdempotencyConflict(String),

    #[error("{0}")]
    CheckoutNotModifiable(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl UcpError {
    pub fn payment_failed(message: impl Into<String>, code: &'static str) -> Self {
        Self::PaymentFailed {
            message: message.into(),
            code,
            status: StatusCode::PAYMENT_REQUIRED,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::OutOfStock { .. } => "OUT_OF_STOCK",
            Self::PaymentFailed { code, .. } => code,
            Self::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            Self::CheckoutNotModifiable(_) => "CHECKOUT_NOT_MODIFIABLE",
            Self::Database(_) | Self::Serialization(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::OutOfStock { conflict, .. } => {
                if *conflict {
                    StatusCode::CONFLICT
                } else {
                    StatusCode::BAD_REQUEST
                }
            }
            Self::PaymentFailed { status, .. } => *status,
            Self::IdempotencyConflict(_) | Self::CheckoutNotModifiable(_) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UcpError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {self}");
        }
        let body = json!({
            "detail": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}
