//! HTTP route modules for the UCP merchant server.
//!
//! Each module defines the axum routes for one resource area:
//! - `checkout`: checkout session lifecycle
//! - `orders`: order retrieval, update, and shipping simulation
//! - `webhooks`: inbound partner order events
//! - `discovery`: the `/.well-known/ucp` merchant profile

pub mod checkout;
pub mod discovery;
pub mod orders;
pub mod webhooks;
