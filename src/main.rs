//! # UCP Merchant Server
//!
//! Binary entry point: loads configuration from the environment, opens and
//! migrates the two embedded databases, and serves the UCP shopping API.
//!
//! Required configuration (process exits 1 when unset):
//! - `UCP_PRODUCTS_DB_PATH`: path to the catalog SQLite database
//! - `UCP_TRANSACTIONS_DB_PATH`: path to the transactions SQLite database
//! - `UCP_PORT`: listen port

use tracing::{error, info};

use ucp_merchant_server::config::Config;
use ucp_merchant_server::{create_app, db, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ucp_merchant_server=info,tower_http=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            eprintln!(
                "\nUsage: UCP_PRODUCTS_DB_PATH, UCP_TRANSACTIONS_DB_PATH and UCP_PORT must be provided."
            );
            std::process::exit(1);
        }
    };

    info!("Starting UCP merchant server (version {})", ucp_merchant_server::config::server_version());

    let products = db::connect(&config.products_db_path).await?;
    db::PRODUCTS_MIGRATOR.run(&products).await?;
    let transactions = db::connect(&config.transactions_db_path).await?;
    db::TRANSACTIONS_MIGRATOR.run(&transactions).await?;
    info!(
        "Databases ready (catalog: {}, transactions: {})",
        config.products_db_path, config.transactions_db_path
    );

    let port = config.port;
    let state = AppState::new(products, transactions, config);
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
