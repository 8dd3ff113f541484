//! Persistence layer for the UCP merchant server.
//!
//! Two embedded SQLite databases back the service: a products (catalog)
//! database holding products and promotions, and a transactions database
//! holding inventory, checkout sessions, orders, idempotency records, the
//! request log, customers/addresses, discounts and shipping rates. Both run
//! in WAL mode so concurrent readers never block the writer.
//!
//! Access helpers are generic over `SqliteExecutor`, so the same function
//! runs against a pool or inside an open transaction. All writes performed
//! during a single command happen on one transaction committed by the
//! caller.

use std::time::Duration;

use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{CheckoutStatus, DestinationRequest};

pub static PRODUCTS_MIGRATOR: Migrator = sqlx::migrate!("./migrations/catalog");
pub static TRANSACTIONS_MIGRATOR: Migrator = sqlx::migrate!("./migrations/transactions");

/// Opens a SQLite pool on `path` in WAL mode, creating the file if absent.
pub async fn connect(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
}

// ============================================================================
// Row types
// ============================================================================

/// A catalog product. Read-only from the core's perspective.
#[derive(Debug, Clone, FromRow)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub price: i64,
    pub image_url: Option<String>,
}

/// An active promotion, e.g. free shipping above a subtotal threshold or for
/// specific items.
#[derive(Debug, Clone, FromRow)]
pub struct Promotion {
    pub id: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub min_subtotal: Option<i64>,
    /// JSON array of product ids, stored as text.
    pub eligible_item_ids: Option<String>,
    pub description: Option<String>,
}

impl Promotion {
    pub fn eligible_item_ids(&self) -> Vec<String> {
        self.eligible_item_ids
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// A discount code: `percentage` (value = percent) or `fixed_amount`
/// (value in minor units).
#[derive(Debug, Clone, FromRow)]
pub struct Discount {
    pub code: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub value: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ShippingRate {
    pub id: String,
    pub country_code: String,
    pub service_level: String,
    pub price: i64,
    pub title: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_hash: String,
    pub response_status: i64,
    /// Serialized response body, replayed verbatim on a matching retry.
    pub response_body: String,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Customer {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CustomerAddress {
    pub id: String,
    pub customer_id: String,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

// ============================================================================
// Catalog store
// ============================================================================

pub async fn get_product<'e, E>(ex: E, product_id: &str) -> Result<Option<Product>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as("SELECT id, title, price, image_url FROM products WHERE id = ?")
        .bind(product_id)
        .fetch_optional(ex)
        .await
}

pub async fn get_active_promotions<'e, E>(ex: E) -> Result<Vec<Promotion>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as(
        "SELECT id, type, min_subtotal, eligible_item_ids, description FROM promotions ORDER BY id",
    )
    .fetch_all(ex)
    .await
}

// ============================================================================
// Transaction store: rates and discounts
// ============================================================================

/// Rates matching the country plus the `default` fallback rates.
pub async fn get_shipping_rates<'e, E>(
    ex: E,
    country_code: &str,
) -> Result<Vec<ShippingRate>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as(
        "SELECT id, country_code, service_level, price, title FROM shipping_rates \
         WHERE country_code IN (?, 'default') ORDER BY id",
    )
    .bind(country_code)
    .fetch_all(ex)
    .await
}

pub async fn get_discount<'e, E>(ex: E, code: &str) -> Result<Option<Discount>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as("SELECT code, type, value, description FROM discounts WHERE code = ?")
        .bind(code)
        .fetch_optional(ex)
        .await
}

/// Batch lookup to avoid one query per code during recomputation.
pub async fn get_discounts_by_codes<'e, E>(
    ex: E,
    codes: &[String],
) -> Result<Vec<Discount>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    if codes.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder = sqlx::QueryBuilder::new(
        "SELECT code, type, value, description FROM discounts WHERE code IN (",
    );
    let mut separated = builder.separated(", ");
    for code in codes {
        separated.push_bind(code);
    }
    builder.push(")");
    builder.build_query_as::<Discount>().fetch_all(ex).await
}

// ============================================================================
// Transaction store: inventory
// ============================================================================

pub async fn get_inventory<'e, E>(ex: E, product_id: &str) -> Result<Option<i64>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    let row: Option<(i64,)> = sqlx::query_as("SELECT quantity FROM inventory WHERE product_id = ?")
        .bind(product_id)
        .fetch_optional(ex)
        .await?;
    Ok(row.map(|(quantity,)| quantity))
}

/// Atomically decrements inventory iff sufficient stock exists.
///
/// The conditional update is a single statement; under concurrent callers
/// exactly one decrement takes effect when capacity is tight, and the
/// affected-row count signals which caller won.
pub async fn reserve_stock<'e, E>(
    ex: E,
    product_id: &str,
    quantity: i64,
) -> Result<bool, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE inventory SET quantity = quantity - ?1 \
         WHERE product_id = ?2 AND quantity >= ?1",
    )
    .bind(quantity)
    .bind(product_id)
    .execute(ex)
    .await?;
    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Transaction store: checkouts and orders
// ============================================================================

pub async fn save_checkout<'e, E>(
    ex: E,
    checkout_id: &str,
    status: CheckoutStatus,
    body: &Value,
) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO checkouts (id, status, data) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data",
    )
    .bind(checkout_id)
    .bind(status.as_str())
    .bind(body.to_string())
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_checkout<'e, E>(ex: E, checkout_id: &str) -> Result<Option<Value>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT data FROM checkouts WHERE id = ?")
        .bind(checkout_id)
        .fetch_optional(ex)
        .await?;
    match row {
        Some((data,)) => Ok(Some(
            serde_json::from_str(&data).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        )),
        None => Ok(None),
    }
}

pub async fn save_order<'e, E>(ex: E, order_id: &str, body: &Value) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO orders (id, data) VALUES (?, ?) \
         ON CONFLICT(id) DO UPDATE SET data = excluded.data",
    )
    .bind(order_id)
    .bind(body.to_string())
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_order<'e, E>(ex: E, order_id: &str) -> Result<Option<Value>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT data FROM orders WHERE id = ?")
        .bind(order_id)
        .fetch_optional(ex)
        .await?;
    match row {
        Some((data,)) => Ok(Some(
            serde_json::from_str(&data).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        )),
        None => Ok(None),
    }
}

// ============================================================================
// Transaction store: request log and idempotency
// ============================================================================

/// Appends an observational request-log row.
pub async fn log_request<'e, E>(
    ex: E,
    method: &str,
    url: &str,
    checkout_id: Option<&str>,
    payload: Option<&Value>,
) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO request_logs (timestamp, method, url, checkout_id, payload) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(method)
    .bind(url)
    .bind(checkout_id)
    .bind(payload.map(|p| p.to_string()))
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_idempotency_record<'e, E>(
    ex: E,
    key: &str,
) -> Result<Option<IdempotencyRecord>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as(
        "SELECT key, request_hash, response_status, response_body, created_at \
         FROM idempotency_records WHERE key = ?",
    )
    .bind(key)
    .fetch_optional(ex)
    .await
}

/// Writes an idempotency record. `INSERT OR IGNORE` makes the second write
/// of a concurrent pair a no-op, so both callers observe the winner's
/// response.
pub async fn save_idempotency_record<'e, E>(
    ex: E,
    key: &str,
    request_hash: &str,
    response_status: u16,
    response_body: &Value,
) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT OR IGNORE INTO idempotency_records \
         (key, request_hash, response_status, response_body, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(key)
    .bind(request_hash)
    .bind(i64::from(response_status))
    .bind(response_body.to_string())
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(ex)
    .await?;
    Ok(())
}

// ============================================================================
// Transaction store: customers and addresses
// ============================================================================

pub async fn get_customer<'e, E>(ex: E, email: &str) -> Result<Option<Customer>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as("SELECT id, name, email FROM customers WHERE email = ?")
        .bind(email)
        .fetch_optional(ex)
        .await
}

pub async fn get_customer_addresses<'e, E>(
    ex: E,
    email: &str,
) -> Result<Vec<CustomerAddress>, sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as(
        "SELECT a.id, a.customer_id, a.street_address, a.city, a.state, a.postal_code, a.country \
         FROM customer_addresses a JOIN customers c ON a.customer_id = c.id \
         WHERE c.email = ? ORDER BY a.id",
    )
    .bind(email)
    .fetch_all(ex)
    .await
}

/// Persists a customer address, reusing the existing id when an address with
/// identical fields already exists for the same customer. Creates the
/// customer on first contact.
pub async fn save_customer_address(
    conn: &mut SqliteConnection,
    email: &str,
    dest: &DestinationRequest,
) -> Result<String, sqlx::Error> {
    let customer = get_customer(&mut *conn, email).await?;
    let customer_id = match customer {
        Some(c) => c.id,
        None => {
            let id = Uuid::new_v4().to_string();
            sqlx::query("INSERT INTO customers (id, name, email) VALUES (?, 'Unknown', ?)")
                .bind(&id)
                .bind(email)
                .execute(&mut *conn)
                .await?;
            id
        }
    };

    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM customer_addresses \
         WHERE customer_id = ? AND street_address IS ? AND city IS ? \
           AND state IS ? AND postal_code IS ? AND country IS ?",
    )
    .bind(&customer_id)
    .bind(&dest.street_address)
    .bind(&dest.address_locality)
    .bind(&dest.address_region)
    .bind(&dest.postal_code)
    .bind(&dest.address_country)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let id = dest
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    sqlx::query(
        "INSERT INTO customer_addresses \
         (id, customer_id, street_address, city, state, postal_code, country) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&customer_id)
    .bind(&dest.street_address)
    .bind(&dest.address_locality)
    .bind(&dest.address_region)
    .bind(&dest.postal_code)
    .bind(&dest.address_country)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

// ============================================================================
// Seeding (used by deployments and the integration suite)
// ============================================================================

pub async fn upsert_product<'e, E>(
    ex: E,
    id: &str,
    title: &str,
    price: i64,
    image_url: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO products (id, title, price, image_url) VALUES (?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, price = excluded.price, \
         image_url = excluded.image_url",
    )
    .bind(id)
    .bind(title)
    .bind(price)
    .bind(image_url)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn upsert_promotion<'e, E>(
    ex: E,
    id: &str,
    kind: &str,
    min_subtotal: Option<i64>,
    eligible_item_ids: Option<&[String]>,
    description: &str,
) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    let eligible = match eligible_item_ids {
        Some(ids) => {
            Some(serde_json::to_string(ids).map_err(|e| sqlx::Error::Encode(Box::new(e)))?)
        }
        None => None,
    };
    sqlx::query(
        "INSERT INTO promotions (id, type, min_subtotal, eligible_item_ids, description) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET type = excluded.type, \
         min_subtotal = excluded.min_subtotal, \
         eligible_item_ids = excluded.eligible_item_ids, \
         description = excluded.description",
    )
    .bind(id)
    .bind(kind)
    .bind(min_subtotal)
    .bind(eligible)
    .bind(description)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn set_inventory<'e, E>(ex: E, product_id: &str, quantity: i64) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO inventory (product_id, quantity) VALUES (?, ?) \
         ON CONFLICT(product_id) DO UPDATE SET quantity = excluded.quantity",
    )
    .bind(product_id)
    .bind(quantity)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn upsert_shipping_rate<'e, E>(
    ex: E,
    id: &str,
    country_code: &str,
    service_level: &str,
    price: i64,
    title: &str,
) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO shipping_rates (id, country_code, service_level, price, title) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET country_code = excluded.country_code, \
         service_level = excluded.service_level, price = excluded.price, title = excluded.title",
    )
    .bind(id)
    .bind(country_code)
    .bind(service_level)
    .bind(price)
    .bind(title)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn upsert_discount<'e, E>(
    ex: E,
    code: &str,
    kind: &str,
    value: i64,
    description: &str,
) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO discounts (code, type, value, description) VALUES (?, ?, ?, ?) \
         ON CONFLICT(code) DO UPDATE SET type = excluded.type, value = excluded.value, \
         description = excluded.description",
    )
    .bind(code)
    .bind(kind)
    .bind(value)
    .bind(description)
    .execute(ex)
    .await?;
    Ok(())
}
