//! # UCP Merchant Reference Server
//!
//! A stateful HTTP service hosting checkout sessions, evolving each session
//! through its lifecycle and converting it atomically into an order. Exposes
//! the axum router and modules so integration tests can create an in-process
//! server without requiring `cargo run` in another terminal.
//!
//! ## Architecture
//!
//! - Axum handles HTTP routing and translates domain errors into the
//!   protocol's status envelope
//! - SQLx manages two embedded SQLite databases in WAL mode: a read-mostly
//!   product catalog and a read-write transactions store
//! - The checkout engine runs every state-mutating command on one immediate
//!   transaction, guarded by idempotency records
//! - Webhook notification is fire-and-forget after commit

pub mod config;
pub mod db;
pub mod error;
pub mod headers;
pub mod idempotency;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::{Extension, Router};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::services::webhook::WebhookNotifier;

/// Shared application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Catalog database: products and promotions.
    pub products: SqlitePool,
    /// Transactions database: inventory, sessions, orders, idempotency.
    pub transactions: SqlitePool,
    pub config: Arc<Config>,
    pub notifier: WebhookNotifier,
}

impl AppState {
    pub fn new(products: SqlitePool, transactions: SqlitePool, config: Config) -> Self {
        Self {
            products,
            transactions,
            config: Arc::new(config),
            notifier: WebhookNotifier::new(),
        }
    }
}

/// Build the axum router with all route modules and middleware.
///
/// The caller is responsible for providing connected, migrated pools. This
/// function does not bind a listener.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::checkout::router())
        .merge(routes::orders::router())
        .merge(routes::webhooks::router())
        .merge(routes::discovery::router())
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
