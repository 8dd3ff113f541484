//! Payment dispatch, polymorphic over `handler_id`.
//!
//! Each handler validates a token credential and accepts or rejects the
//! charge attempt. Card credentials are accepted up front regardless of
//! handler; only the last four digits ever reach the log. An unknown
//! handler id is a request error, not a payment failure.

use axum::http::StatusCode;
use tracing::{info, warn};

use crate::error::UcpError;
use crate::models::{Credential, PaymentCreateRequest};

pub trait PaymentHandler: Send + Sync {
    /// Authorizes a charge against a token credential.
    fn authorize(&self, token: &str) -> Result<(), UcpError>;
}

/// Test handler driven entirely by well-known tokens.
struct MockPaymentHandler;

impl PaymentHandler for MockPaymentHandler {
    fn authorize(&self, token: &str) -> Result<(), UcpError> {
        match token {
            "success_token" => Ok(()),
            "fail_token" => Err(UcpError::payment_failed(
                "Payment Failed: Insufficient Funds (Mock)",
                "INSUFFICIENT_FUNDS",
            )),
            "fraud_token" => Err(UcpError::PaymentFailed {
                message: "Payment Failed: Fraud Detected (Mock)".into(),
                code: "FRAUD_DETECTED",
                status: StatusCode::FORBIDDEN,
            }),
            other => Err(UcpError::payment_failed(
                format!("Unknown mock token: {other}"),
                "UNKNOWN_TOKEN",
            )),
        }
    }
}

/// Accepts any token; there is no real network behind it.
struct GooglePayHandler;

impl PaymentHandler for GooglePayHandler {
    fn authorize(&self, _token: &str) -> Result<(), UcpError> {
        Ok(())
    }
}

struct ShopPayHandler;

impl PaymentHandler for ShopPayHandler {
    fn authorize(&self, _token: &str) -> Result<(), UcpError> {
        Ok(())
    }
}

fn handler_for(handler_id: &str) -> Option<&'static dyn PaymentHandler> {
    match handler_id {
        "mock_payment_handler" => Some(&MockPaymentHandler),
        "google_pay" => Some(&GooglePayHandler),
        "shop_pay" => Some(&ShopPayHandler),
        _ => None,
    }
}

/// Validates the selected instrument and dispatches the charge to its
/// handler.
pub fn process_payment(payment: &PaymentCreateRequest) -> Result<(), UcpError> {
    if payment.instruments.is_empty() {
        return Err(UcpError::InvalidRequest("Missing payment instruments".into()));
    }

    let selected_id = payment
        .selected_instrument_id
        .as_deref()
        .ok_or_else(|| UcpError::InvalidRequest("Missing selected_instrument_id".into()))?;

    let instrument = payment
        .instruments
        .iter()
        .find(|i| i.id == selected_id)
        .ok_or_else(|| {
            UcpError::InvalidRequest(format!("Selected instrument {selected_id} not found"))
        })?;

    let credential = instrument
        .credential
        .as_ref()
        .ok_or_else(|| UcpError::InvalidRequest("Missing credentials in instrument".into()))?;

    let token = match credential {
        Credential::Card(card) => {
            let last_four = if card.number.len() >= 4 {
                &card.number[card.number.len() - 4..]
            } else {
                "unknown"
            };
            info!("Processing card payment for card ending in {last_four}");
            return Ok(());
        }
        Credential::Token(token) => token.token.as_str(),
    };

    match handler_for(&instrument.handler_id) {
        Some(handler) => handler.authorize(token),
        None => {
            warn!("Rejected unsupported payment handler {}", instrument.handler_id);
            Err(UcpError::InvalidRequest(format!(
                "Unsupported payment handler: {}",
                instrument.handler_id
            )))
        }
    }
}
