//! Server configuration.
//!
//! Configuration comes from the environment (dotenv-friendly). The catalog
//! DB path, transactions DB path, and port are mandatory; the process exits
//! with code 1 when any of them is missing. The protocol version is read
//! once from the embedded discovery profile template, which is also what
//! `/.well-known/ucp` serves.

use std::sync::OnceLock;

use anyhow::Context;
use uuid::Uuid;

/// Discovery profile template served at `/.well-known/ucp` with
/// `{{ENDPOINT}}` and `{{SHOP_ID}}` substituted per instance.
pub const PROFILE_TEMPLATE: &str = include_str!("routes/discovery_profile.json");

static SERVER_VERSION: OnceLock<String> = OnceLock::new();

/// The protocol version this server implements, from the discovery profile.
pub fn server_version() -> &'static str {
    SERVER_VERSION.get_or_init(|| {
        let profile: serde_json::Value =
            serde_json::from_str(PROFILE_TEMPLATE).expect("embedded discovery profile is valid JSON");
        profile["ucp"]["version"]
            .as_str()
            .expect("discovery profile declares ucp.version")
            .to_string()
    })
}

#[derive(Debug, Clone)]
pub struct Config {
    pub products_db_path: String,
    pub transactions_db_path: String,
    pub port: u16,
    /// Base URL used for order permalinks and discovery endpoint
    /// substitution.
    pub base_url: String,
    /// Shared secret guarding the shipping simulation endpoint.
    pub simulation_secret: String,
    /// Shop identifier, unique per server instance.
    pub shop_id: String,
}

impl Config {
    /// Reads configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when `UCP_PRODUCTS_DB_PATH`, `UCP_TRANSACTIONS_DB_PATH`
    /// or `UCP_PORT` is unset or unparsable.
    pub fn from_env() -> anyhow::Result<Self> {
        let products_db_path =
            std::env::var("UCP_PRODUCTS_DB_PATH").context("UCP_PRODUCTS_DB_PATH must be set")?;
        let transactions_db_path = std::env::var("UCP_TRANSACTIONS_DB_PATH")
            .context("UCP_TRANSACTIONS_DB_PATH must be set")?;
        let port: u16 = std::env::var("UCP_PORT")
            .context("UCP_PORT must be set")?
            .parse()
            .context("UCP_PORT must be a valid port number")?;

        let base_url = std::env::var("UCP_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"));
        let simulation_secret = std::env::var("UCP_SIMULATION_SECRET")
            .unwrap_or_else(|_| Uuid::new_v4().to_string());

        Ok(Self {
            products_db_path,
            transactions_db_path,
            port,
            base_url: base_url.trim_end_matches('/').to_string(),
            simulation_secret,
            shop_id: Uuid::new_v4().to_string(),
        })
    }

    /// Constructor for tests and embedded use.
    pub fn for_paths(
        products_db_path: impl Into<String>,
        transactions_db_path: impl Into<String>,
        base_url: impl Into<String>,
        simulation_secret: impl Into<String>,
    ) -> Self {
        Self {
            products_db_path: products_db_path.into(),
            transactions_db_path: transactions_db_path.into(),
            port: 0,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            simulation_secret: simulation_secret.into(),
            shop_id: Uuid::new_v4().to_string(),
        }
    }
}
