//! # Integration Tests
//!
//! These tests boot an in-process server on a random port and send HTTP
//! requests to it via reqwest. No external `cargo run` is needed: the two
//! SQLite databases live in a temporary directory and are migrated on boot.
//!
//! The server is shared across tests (booted once via `OnceLock`); each test
//! seeds its own product ids so inventory interactions stay isolated.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, OnceLock};

    use axum::routing::{get, post};
    use axum::{Extension, Json, Router};
    use serde_json::{json, Value};
    use sqlx::SqlitePool;
    use uuid::Uuid;

    use ucp_merchant_server::config::Config;
    use ucp_merchant_server::{create_app, db, AppState};

    const SIMULATION_SECRET: &str = "sim-secret-test";

    struct TestContext {
        base_url: String,
        products_db_path: String,
        transactions_db_path: String,
    }

    static TEST_CONTEXT: OnceLock<TestContext> = OnceLock::new();

    /// Boot the in-process test server once in a background thread, returning
    /// base URL and database paths.
    ///
    /// Uses a dedicated tokio runtime on a background thread so it doesn't
    /// conflict with #[tokio::test]'s per-test runtime. Tests open their own
    /// pools on the same database files (WAL mode allows the concurrent
    /// access).
    fn context() -> &'static TestContext {
        TEST_CONTEXT.get_or_init(|| {
            let (tx, rx) = std::sync::mpsc::channel();

            std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to build tokio runtime for test server");

                rt.block_on(async {
                    let dir = Box::leak(Box::new(
                        tempfile::tempdir().expect("Failed to create temp dir"),
                    ));
                    let products_db_path =
                        dir.path().join("products.db").to_string_lossy().to_string();
                    let transactions_db_path = dir
                        .path()
                        .join("transactions.db")
                        .to_string_lossy()
                        .to_string();

                    let products = db::connect(&products_db_path)
                        .await
                        .expect("Failed to open products DB");
                    db::PRODUCTS_MIGRATOR
                        .run(&products)
                        .await
                        .expect("Failed to migrate products DB");
                    let transactions = db::connect(&transactions_db_path)
                        .await
                        .expect("Failed to open transactions DB");
                    db::TRANSACTIONS_MIGRATOR
                        .run(&transactions)
                        .await
                        .expect("Failed to migrate transactions DB");

                    // Shared rates, discounts and promotions. Product ids are
                    // per-test.
                    db::upsert_shipping_rate(&transactions, "std-ship", "US", "standard", 500, "Standard Shipping")
                        .await
                        .expect("seed rate");
                    db::upsert_shipping_rate(&transactions, "exp-ship", "default", "express", 1500, "Express Shipping")
                        .await
                        .expect("seed rate");
                    db::upsert_discount(&transactions, "10OFF", "percentage", 10, "10% off")
                        .await
                        .expect("seed discount");
                    db::upsert_discount(&transactions, "WELCOME5", "fixed_amount", 500, "5 off your first order")
                        .await
                        .expect("seed discount");
                    let eligible = vec!["fs_orchid".to_string()];
                    db::upsert_promotion(
                        &products,
                        "free_ship_orchid",
                        "free_shipping",
                        None,
                        Some(&eligible),
                        "Free standard shipping on orchids",
                    )
                    .await
                    .expect("seed promotion");

                    // Bind to port 0 for an OS-assigned random port.
                    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                        .await
                        .expect("Failed to bind test listener");
                    let addr = listener.local_addr().expect("Failed to get local address");
                    let base_url = format!("http://127.0.0.1:{}", addr.port());

                    let config = Config::for_paths(
                        &products_db_path,
                        &transactions_db_path,
                        &base_url,
                        SIMULATION_SECRET,
                    );
                    let app = create_app(AppState::new(products, transactions, config));

                    tx.send(TestContext {
                        base_url: base_url.clone(),
                        products_db_path,
                        transactions_db_path,
                    })
                    .expect("Failed to send test server context");

                    axum::serve(listener, app).await.expect("Test server failed");
                });
            });

            rx.recv().expect("Failed to receive test server context")
        })
    }

    async fn products_pool() -> SqlitePool {
        db::connect(&context().products_db_path)
            .await
            .expect("Failed to open products DB")
    }

    async fn transactions_pool() -> SqlitePool {
        db::connect(&context().transactions_db_path)
            .await
            .expect("Failed to open transactions DB")
    }

    /// Seeds a product with inventory under a per-test id.
    async fn seed_product(id: &str, title: &str, price: i64, quantity: i64) {
        let products = products_pool().await;
        db::upsert_product(&products, id, title, price, None)
            .await
            .expect("seed product");
        let transactions = transactions_pool().await;
        db::set_inventory(&transactions, id, quantity)
            .await
            .expect("seed inventory");
    }

    async fn inventory_of(product_id: &str) -> Option<i64> {
        let transactions = transactions_pool().await;
        db::get_inventory(&transactions, product_id)
            .await
            .expect("read inventory")
    }

    const UCP_AGENT: &str = "version=\"2026-01-11\"";

    fn with_headers(builder: reqwest::RequestBuilder, idempotency_key: &str) -> reqwest::RequestBuilder {
        builder
            .header("UCP-Agent", UCP_AGENT)
            .header("Request-Signature", "test")
            .header("Request-Id", Uuid::new_v4().to_string())
            .header("Idempotency-Key", idempotency_key)
    }

    /// Checkout payload with a US shipping destination and the standard
    /// option preselected, the shape the reference shopper agent sends.
    fn checkout_payload(checkout_id: &str, items: &[(&str, &str, i64, i64)]) -> Value {
        let line_items: Vec<Value> = items
            .iter()
            .map(|(id, title, price, quantity)| {
                json!({
                    "item": {"id": id, "title": title, "price": price},
                    "quantity": quantity,
                })
            })
            .collect();
        json!({
            "id": checkout_id,
            "currency": "USD",
            "line_items": line_items,
            "payment": {"handlers": [{"id": "google_pay", "name": "google.pay"}], "instruments": []},
            "fulfillment": {"methods": [{
                "type": "shipping",
                "destinations": [{"id": "dest_1", "address_country": "US"}],
                "selected_destination_id": "dest_1",
                "groups": [{"selected_option_id": "std-ship"}],
            }]},
        })
    }

    fn complete_payload(token: &str) -> Value {
        json!({
            "payment_data": {
                "id": "instr_1",
                "handler_id": "mock_payment_handler",
                "type": "card",
                "brand": "Visa",
                "last_digits": "1234",
                "credential": {"type": "token", "token": token},
            },
            "risk_signals": {},
        })
    }

    async fn create_checkout(client: &reqwest::Client, payload: &Value, key: &str) -> reqwest::Response {
        with_headers(
            client.post(format!("{}/checkout-sessions", context().base_url)),
            key,
        )
        .json(payload)
        .send()
        .await
        .expect("Failed to send create request")
    }

    async fn complete_checkout(
        client: &reqwest::Client,
        checkout_id: &str,
        payload: &Value,
        key: &str,
    ) -> reqwest::Response {
        with_headers(
            client.post(format!(
                "{}/checkout-sessions/{checkout_id}/complete",
                context().base_url
            )),
            key,
        )
        .json(payload)
        .send()
        .await
        .expect("Failed to send complete request")
    }

    fn trailing_total(body: &Value) -> i64 {
        let totals = body["totals"].as_array().expect("totals array");
        let last = totals.last().expect("non-empty totals");
        assert_eq!(last["type"], "total", "trailing totals entry must be total");
        last["amount"].as_i64().expect("total amount")
    }

    // -----------------------------------------------------------------------
    // Checkout lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_single_item_checkout_lifecycle() {
        seed_product("rose_s1", "Red Rose", 1000, 5).await;
        let client = reqwest::Client::new();

        // 1. Create: totals are recomputed from the catalog, 2 x 1000 + 500
        // standard shipping.
        let payload = checkout_payload("chk_s1", &[("rose_s1", "Red Rose", 1000, 2)]);
        let res = create_checkout(&client, &payload, "s1-create").await;
        assert_eq!(res.status(), 201, "Expected 201 Created");
        let body: Value = res.json().await.expect("Failed to parse response");

        assert_eq!(body["id"], "chk_s1");
        assert_eq!(body["status"], "ready_for_complete");
        assert_eq!(body["currency"], "USD");
        assert_eq!(body["totals"][0]["type"], "subtotal");
        assert_eq!(body["totals"][0]["amount"], 2000);
        assert_eq!(trailing_total(&body), 2500);

        // Line item subtotal comes from the catalog price, not the request.
        let line = &body["line_items"][0];
        assert_eq!(line["item"]["price"], 1000);
        assert_eq!(line["totals"][0]["type"], "subtotal");
        assert_eq!(line["totals"][0]["amount"], 2000);

        // Options were computed for the destination, US rate preferred.
        let options = body["fulfillment"]["methods"][0]["groups"][0]["options"]
            .as_array()
            .expect("group options");
        assert!(options.iter().any(|o| o["id"] == "std-ship"));

        // 2. Complete with the success token.
        let res = complete_checkout(&client, "chk_s1", &complete_payload("success_token"), "s1-complete").await;
        assert_eq!(res.status(), 200, "Expected 200 OK");
        let body: Value = res.json().await.expect("Failed to parse response");
        assert_eq!(body["status"], "completed");
        let order_id = body["order"]["id"].as_str().expect("order id").to_string();
        let permalink = body["order"]["permalink_url"].as_str().expect("permalink");
        assert!(permalink.ends_with(&format!("/orders/{order_id}")));

        // 3. Inventory decremented by exactly the session quantity.
        assert_eq!(inventory_of("rose_s1").await, Some(3));

        // 4. A fresh create exceeding remaining stock fails the advisory
        // check with 400.
        let payload = checkout_payload("chk_s1b", &[("rose_s1", "Red Rose", 1000, 4)]);
        let res = create_checkout(&client, &payload, "s1-overdraw").await;
        assert_eq!(res.status(), 400);
        let body: Value = res.json().await.expect("Failed to parse response");
        assert_eq!(body["code"], "OUT_OF_STOCK");
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .contains("Insufficient stock for item rose_s1"));
    }

    #[tokio::test]
    async fn test_inventory_race_single_winner() {
        seed_product("tulip_s2", "White Tulip", 800, 2).await;
        let client = reqwest::Client::new();

        // Both sessions pass the advisory check at creation time.
        for (checkout_id, key) in [("chk_s2a", "s2-create-a"), ("chk_s2b", "s2-create-b")] {
            let payload = checkout_payload(checkout_id, &[("tulip_s2", "White Tulip", 800, 2)]);
            let res = create_checkout(&client, &payload, key).await;
            assert_eq!(res.status(), 201);
        }

        // Concurrent completes race on the atomic reserve.
        let payload = complete_payload("success_token");
        let (res_a, res_b) = tokio::join!(
            complete_checkout(&client, "chk_s2a", &payload, "s2-complete-a"),
            complete_checkout(&client, "chk_s2b", &payload, "s2-complete-b"),
        );

        let statuses = [res_a.status().as_u16(), res_b.status().as_u16()];
        let mut sorted = statuses;
        sorted.sort();
        assert_eq!(sorted, [200, 409], "exactly one winner, got {statuses:?}");

        let loser = if statuses[0] == 409 { res_a } else { res_b };
        let body: Value = loser.json().await.expect("Failed to parse loser body");
        assert_eq!(body["code"], "OUT_OF_STOCK");
        assert!(body["detail"].as_str().unwrap().contains("out of stock"));

        assert_eq!(inventory_of("tulip_s2").await, Some(0));
    }

    #[tokio::test]
    async fn test_idempotency_replay_and_conflict() {
        seed_product("rose_s3", "Red Rose", 1000, 50).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_s3", &[("rose_s3", "Red Rose", 1000, 1)]);
        let res = create_checkout(&client, &payload, "s3-key").await;
        assert_eq!(res.status(), 201);
        let first = res.text().await.expect("first body");

        // Same key, same body: byte-identical replay, no re-execution.
        let res = create_checkout(&client, &payload, "s3-key").await;
        assert_eq!(res.status(), 201);
        let second = res.text().await.expect("second body");
        assert_eq!(first, second, "replay must be byte-identical");

        // Same key, different body: conflict.
        let altered = checkout_payload("chk_s3", &[("rose_s3", "Red Rose", 1000, 2)]);
        let res = create_checkout(&client, &altered, "s3-key").await;
        assert_eq!(res.status(), 409);
        let body: Value = res.json().await.expect("conflict body");
        assert_eq!(body["code"], "IDEMPOTENCY_CONFLICT");
    }

    #[tokio::test]
    async fn test_discount_application() {
        seed_product("lily_s4", "Calla Lily", 5000, 50).await;
        let client = reqwest::Client::new();

        // The shared seed is visible through the single-code lookup too.
        let transactions = transactions_pool().await;
        let discount = db::get_discount(&transactions, "10OFF")
            .await
            .expect("read discount")
            .expect("10OFF seeded");
        assert_eq!(discount.kind, "percentage");
        assert_eq!(discount.value, 10);

        // Percentage: 10% of 10 000, truncated.
        let mut payload = checkout_payload("chk_s4a", &[("lily_s4", "Calla Lily", 5000, 2)]);
        payload["fulfillment"] = Value::Null;
        payload["discounts"] = json!({"codes": ["10OFF"]});
        let res = create_checkout(&client, &payload, "s4-percentage").await;
        assert_eq!(res.status(), 201);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["discounts"]["applied"][0]["code"], "10OFF");
        assert_eq!(body["discounts"]["applied"][0]["amount"], 1000);
        assert_eq!(trailing_total(&body), 9000);
        assert!(body["totals"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["type"] == "discount" && t["amount"] == 1000));

        // Fixed amount.
        let mut payload = checkout_payload("chk_s4b", &[("lily_s4", "Calla Lily", 5000, 2)]);
        payload["fulfillment"] = Value::Null;
        payload["discounts"] = json!({"codes": ["WELCOME5"]});
        let res = create_checkout(&client, &payload, "s4-fixed").await;
        assert_eq!(res.status(), 201);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["discounts"]["applied"][0]["amount"], 500);
        assert_eq!(trailing_total(&body), 9500);

        // Unknown codes are silently dropped.
        let mut payload = checkout_payload("chk_s4c", &[("lily_s4", "Calla Lily", 5000, 2)]);
        payload["fulfillment"] = Value::Null;
        payload["discounts"] = json!({"codes": ["NO_SUCH_CODE"]});
        let res = create_checkout(&client, &payload, "s4-unknown").await;
        assert_eq!(res.status(), 201);
        let body: Value = res.json().await.expect("body");
        assert!(body["discounts"]["applied"].is_null());
        assert_eq!(trailing_total(&body), 10_000);
    }

    #[tokio::test]
    async fn test_version_rejection() {
        seed_product("rose_s5", "Red Rose", 1000, 5).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_s5", &[("rose_s5", "Red Rose", 1000, 1)]);
        let res = client
            .post(format!("{}/checkout-sessions", context().base_url))
            .header("UCP-Agent", "profile=\"https://agent.example/p\"; version=\"2099-01-01\"")
            .header("Request-Signature", "test")
            .header("Request-Id", "s5")
            .header("Idempotency-Key", "s5")
            .json(&payload)
            .send()
            .await
            .expect("Failed to send request");

        assert_eq!(res.status(), 400);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "VERSION_UNSUPPORTED");
        assert_eq!(body["severity"], "critical");
        assert_eq!(
            body["message"],
            "Version 2099-01-01 is not supported. This merchant implements version 2026-01-11."
        );
    }

    #[tokio::test]
    async fn test_terminal_state_is_immutable() {
        seed_product("rose_s6", "Red Rose", 1000, 10).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_s6", &[("rose_s6", "Red Rose", 1000, 1)]);
        assert_eq!(create_checkout(&client, &payload, "s6-create").await.status(), 201);
        let res = complete_checkout(&client, "chk_s6", &complete_payload("success_token"), "s6-complete").await;
        assert_eq!(res.status(), 200);

        // PUT update.
        let res = with_headers(
            client.put(format!("{}/checkout-sessions/chk_s6", context().base_url)),
            "s6-update",
        )
        .json(&json!({"currency": "EUR"}))
        .send()
        .await
        .expect("Failed to send update");
        assert_eq!(res.status(), 409);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "CHECKOUT_NOT_MODIFIABLE");
        assert_eq!(body["detail"], "Cannot update checkout in state 'completed'");

        // Cancel.
        let res = with_headers(
            client.post(format!("{}/checkout-sessions/chk_s6/cancel", context().base_url)),
            "s6-cancel",
        )
        .send()
        .await
        .expect("Failed to send cancel");
        assert_eq!(res.status(), 409);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["detail"], "Cannot cancel checkout in state 'completed'");

        // Complete again under a fresh key.
        let res = complete_checkout(&client, "chk_s6", &complete_payload("success_token"), "s6-again").await;
        assert_eq!(res.status(), 409);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["detail"], "Cannot complete checkout in state 'completed'");

        // GET remains allowed on terminal sessions.
        let res = with_headers(
            client.get(format!("{}/checkout-sessions/chk_s6", context().base_url)),
            "s6-get",
        )
        .send()
        .await
        .expect("Failed to send get");
        assert_eq!(res.status(), 200);
    }

    #[tokio::test]
    async fn test_cancel_flow() {
        seed_product("rose_s8", "Red Rose", 1000, 5).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_s8", &[("rose_s8", "Red Rose", 1000, 1)]);
        assert_eq!(create_checkout(&client, &payload, "s8-create").await.status(), 201);

        let res = with_headers(
            client.post(format!("{}/checkout-sessions/chk_s8/cancel", context().base_url)),
            "s8-cancel",
        )
        .send()
        .await
        .expect("Failed to send cancel");
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["status"], "canceled");

        let res = with_headers(
            client.post(format!("{}/checkout-sessions/chk_s8/cancel", context().base_url)),
            "s8-cancel-again",
        )
        .send()
        .await
        .expect("Failed to send cancel");
        assert_eq!(res.status(), 409);
        let body: Value = res.json().await.expect("body");
        assert!(body["detail"].as_str().unwrap().contains("Cannot cancel checkout"));
    }

    // -----------------------------------------------------------------------
    // Validation and error envelopes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_missing_mandatory_headers() {
        let client = reqwest::Client::new();
        let payload = checkout_payload("chk_hdr", &[("rose_s1", "Red Rose", 1000, 1)]);

        // Missing UCP-Agent.
        let res = client
            .post(format!("{}/checkout-sessions", context().base_url))
            .header("Request-Signature", "test")
            .header("Request-Id", "hdr-1")
            .header("Idempotency-Key", "hdr-1")
            .json(&payload)
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(res.status(), 422);

        // Missing Idempotency-Key.
        let res = client
            .post(format!("{}/checkout-sessions", context().base_url))
            .header("UCP-Agent", UCP_AGENT)
            .header("Request-Signature", "test")
            .header("Request-Id", "hdr-2")
            .json(&payload)
            .send()
            .await
            .expect("Failed to send request");
        assert_eq!(res.status(), 422);
    }

    #[tokio::test]
    async fn test_out_of_stock_and_unknown_product_on_create() {
        seed_product("fern_s9", "Boston Fern", 1200, 1).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_s9", &[("fern_s9", "Boston Fern", 1200, 3)]);
        let res = create_checkout(&client, &payload, "s9-create").await;
        assert_eq!(res.status(), 400);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "OUT_OF_STOCK");

        // Session was not persisted.
        let res = with_headers(
            client.get(format!("{}/checkout-sessions/chk_s9", context().base_url)),
            "s9-get",
        )
        .send()
        .await
        .expect("Failed to send get");
        assert_eq!(res.status(), 404);

        // Unknown product is a request error.
        let payload = checkout_payload("chk_s9b", &[("no_such_plant", "Mystery", 1, 1)]);
        let res = create_checkout(&client, &payload, "s9-unknown").await;
        assert_eq!(res.status(), 400);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "INVALID_REQUEST");
        assert!(body["detail"].as_str().unwrap().contains("no_such_plant"));
    }

    #[tokio::test]
    async fn test_payment_failures_keep_session_retryable() {
        seed_product("rose_s10", "Red Rose", 1000, 10).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_s10", &[("rose_s10", "Red Rose", 1000, 1)]);
        assert_eq!(create_checkout(&client, &payload, "s10-create").await.status(), 201);

        let res = complete_checkout(&client, "chk_s10", &complete_payload("fail_token"), "s10-fail").await;
        assert_eq!(res.status(), 402);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "INSUFFICIENT_FUNDS");

        let res = complete_checkout(&client, "chk_s10", &complete_payload("fraud_token"), "s10-fraud").await;
        assert_eq!(res.status(), 403);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "FRAUD_DETECTED");

        let res = complete_checkout(&client, "chk_s10", &complete_payload("garbage"), "s10-garbage").await;
        assert_eq!(res.status(), 402);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "UNKNOWN_TOKEN");

        // Unsupported handler is a request error, not a payment failure.
        let mut unknown_handler = complete_payload("success_token");
        unknown_handler["payment_data"]["handler_id"] = json!("acme_pay");
        let res = complete_checkout(&client, "chk_s10", &unknown_handler, "s10-handler").await;
        assert_eq!(res.status(), 400);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "INVALID_REQUEST");

        // The session survived every failure at ready_for_complete, and no
        // stock was reserved.
        let res = with_headers(
            client.get(format!("{}/checkout-sessions/chk_s10", context().base_url)),
            "s10-get",
        )
        .send()
        .await
        .expect("Failed to send get");
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["status"], "ready_for_complete");
        assert_eq!(inventory_of("rose_s10").await, Some(10));

        // A retry with a working instrument under a fresh key succeeds.
        let res = complete_checkout(&client, "chk_s10", &complete_payload("success_token"), "s10-retry").await;
        assert_eq!(res.status(), 200);
        assert_eq!(inventory_of("rose_s10").await, Some(9));
    }

    #[tokio::test]
    async fn test_complete_requires_fulfillment_selection() {
        seed_product("ivy_s12", "English Ivy", 900, 10).await;
        let client = reqwest::Client::new();

        // No fulfillment at all.
        let mut payload = checkout_payload("chk_s12", &[("ivy_s12", "English Ivy", 900, 1)]);
        payload["fulfillment"] = Value::Null;
        assert_eq!(create_checkout(&client, &payload, "s12-create").await.status(), 201);

        let res = complete_checkout(&client, "chk_s12", &complete_payload("success_token"), "s12-complete").await;
        assert_eq!(res.status(), 400);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "INVALID_REQUEST");
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .contains("Fulfillment address and option must be selected"));
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_update_recomputes_and_persists_addresses() {
        seed_product("peony_s13", "Pink Peony", 1500, 20).await;
        let client = reqwest::Client::new();

        let mut payload = checkout_payload("chk_s13", &[("peony_s13", "Pink Peony", 1500, 1)]);
        payload["fulfillment"] = Value::Null;
        payload["buyer"] = json!({"email": "buyer-s13@example.com", "full_name": "Test Buyer"});
        assert_eq!(create_checkout(&client, &payload, "s13-create").await.status(), 201);

        let update = json!({
            "line_items": [{"item": {"id": "peony_s13"}, "quantity": 3}],
            "fulfillment": {"methods": [{
                "type": "shipping",
                "destinations": [{
                    "street_address": "12 Garden Row",
                    "address_locality": "Portland",
                    "address_region": "OR",
                    "postal_code": "97201",
                    "address_country": "US",
                }],
            }]},
        });
        let res = with_headers(
            client.put(format!("{}/checkout-sessions/chk_s13", context().base_url)),
            "s13-update",
        )
        .json(&update)
        .send()
        .await
        .expect("Failed to send update");
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");

        assert_eq!(body["status"], "ready_for_complete");
        // Quantity change recomputed against the catalog price.
        assert_eq!(body["totals"][0]["amount"], 4500);
        let dest_id = body["fulfillment"]["methods"][0]["destinations"][0]["id"]
            .as_str()
            .expect("destination id")
            .to_string();

        // Re-sending the same destination reuses the persisted address id.
        let res = with_headers(
            client.put(format!("{}/checkout-sessions/chk_s13", context().base_url)),
            "s13-update-2",
        )
        .json(&update)
        .send()
        .await
        .expect("Failed to send update");
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");
        assert_eq!(
            body["fulfillment"]["methods"][0]["destinations"][0]["id"]
                .as_str()
                .unwrap(),
            dest_id,
            "equal addresses must deduplicate to one id"
        );

        // Selecting the persisted destination prices the shipping option in.
        let select = json!({
            "fulfillment": {"methods": [{
                "type": "shipping",
                "selected_destination_id": dest_id,
                "groups": [{"selected_option_id": "std-ship"}],
            }]},
        });
        let res = with_headers(
            client.put(format!("{}/checkout-sessions/chk_s13", context().base_url)),
            "s13-select",
        )
        .json(&select)
        .send()
        .await
        .expect("Failed to send update");
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");
        assert_eq!(trailing_total(&body), 4500 + 500);
        let option = body["fulfillment"]["methods"][0]["groups"][0]["options"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["id"] == "std-ship")
            .expect("standard option present");
        assert_eq!(option["title"], "Standard Shipping");
    }

    // -----------------------------------------------------------------------
    // Promotions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_free_shipping_promotion_zeroes_standard() {
        seed_product("fs_orchid", "Phalaenopsis Orchid", 2000, 20).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_fs", &[("fs_orchid", "Phalaenopsis Orchid", 2000, 2)]);
        let res = create_checkout(&client, &payload, "fs-create").await;
        assert_eq!(res.status(), 201);
        let body: Value = res.json().await.expect("body");

        let options = body["fulfillment"]["methods"][0]["groups"][0]["options"]
            .as_array()
            .expect("options");
        let standard = options.iter().find(|o| o["id"] == "std-ship").expect("standard option");
        assert_eq!(standard["title"], "Standard Shipping (Free)");
        assert_eq!(standard["totals"][1]["amount"], 0);

        // Selected standard shipping contributes nothing to the total.
        assert_eq!(trailing_total(&body), 4000);
        let express = options.iter().find(|o| o["id"] == "exp-ship").expect("express option");
        assert_eq!(express["totals"][1]["amount"], 1500);
    }

    // -----------------------------------------------------------------------
    // Orders and shipping
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_order_lifecycle_and_shipping_simulation() {
        seed_product("dahlia_s14", "Red Dahlia", 2500, 10).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_s14", &[("dahlia_s14", "Red Dahlia", 2500, 2)]);
        assert_eq!(create_checkout(&client, &payload, "s14-create").await.status(), 201);
        let res = complete_checkout(&client, "chk_s14", &complete_payload("success_token"), "s14-complete").await;
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");
        let order_id = body["order"]["id"].as_str().expect("order id").to_string();

        // GET order: processing line items, one expectation with the
        // resolved destination.
        let res = with_headers(
            client.get(format!("{}/orders/{order_id}", context().base_url)),
            "s14-get",
        )
        .send()
        .await
        .expect("Failed to get order");
        assert_eq!(res.status(), 200);
        let order: Value = res.json().await.expect("order body");
        assert_eq!(order["checkout_id"], "chk_s14");
        assert_eq!(order["currency"], "USD");
        assert_eq!(order["line_items"][0]["status"], "processing");
        assert_eq!(order["line_items"][0]["quantity"]["total"], 2);
        assert_eq!(order["line_items"][0]["quantity"]["fulfilled"], 0);
        let expectation = &order["fulfillment"]["expectations"][0];
        assert_eq!(expectation["method_type"], "shipping");
        assert_eq!(expectation["description"], "Standard Shipping");
        assert_eq!(expectation["destination"]["address_country"], "US");
        assert_eq!(order["fulfillment"]["events"].as_array().unwrap().len(), 0);

        // Unknown order is 404.
        let res = with_headers(
            client.get(format!("{}/orders/no-such-order", context().base_url)),
            "s14-404",
        )
        .send()
        .await
        .expect("Failed to get order");
        assert_eq!(res.status(), 404);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["code"], "RESOURCE_NOT_FOUND");

        // PUT replaces the stored body.
        let mut updated = order.clone();
        updated["line_items"][0]["status"] = json!("packed");
        let res = with_headers(
            client.put(format!("{}/orders/{order_id}", context().base_url)),
            "s14-put",
        )
        .json(&updated)
        .send()
        .await
        .expect("Failed to put order");
        assert_eq!(res.status(), 200);
        let res = with_headers(
            client.get(format!("{}/orders/{order_id}", context().base_url)),
            "s14-get-2",
        )
        .send()
        .await
        .expect("Failed to get order");
        let order: Value = res.json().await.expect("order body");
        assert_eq!(order["line_items"][0]["status"], "packed");

        // Shipping simulation requires the secret.
        let res = with_headers(
            client.post(format!("{}/testing/simulate-shipping/{order_id}", context().base_url)),
            "s14-ship-no-secret",
        )
        .send()
        .await
        .expect("Failed to post shipping");
        assert_eq!(res.status(), 403);

        let res = with_headers(
            client.post(format!("{}/testing/simulate-shipping/{order_id}", context().base_url)),
            "s14-ship",
        )
        .header("Simulation-Secret", SIMULATION_SECRET)
        .send()
        .await
        .expect("Failed to post shipping");
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["status"], "shipped");

        // Shipping is not idempotent: a second call appends another event.
        let res = with_headers(
            client.post(format!("{}/testing/simulate-shipping/{order_id}", context().base_url)),
            "s14-ship-2",
        )
        .header("Simulation-Secret", SIMULATION_SECRET)
        .send()
        .await
        .expect("Failed to post shipping");
        assert_eq!(res.status(), 200);

        let res = with_headers(
            client.get(format!("{}/orders/{order_id}", context().base_url)),
            "s14-get-3",
        )
        .send()
        .await
        .expect("Failed to get order");
        let order: Value = res.json().await.expect("order body");
        let events = order["fulfillment"]["events"].as_array().expect("events");
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e["type"] == "shipped"));
    }

    // -----------------------------------------------------------------------
    // Webhook delivery
    // -----------------------------------------------------------------------

    #[derive(Clone)]
    struct ReceiverConfig {
        webhook_url: String,
    }

    async fn receiver_profile(
        Extension(config): Extension<ReceiverConfig>,
    ) -> Json<Value> {
        Json(json!({
            "ucp": {"capabilities": [{"config": {"webhook_url": config.webhook_url}}]}
        }))
    }

    async fn receiver_event(
        Extension(events): Extension<Arc<Mutex<Vec<Value>>>>,
        Json(event): Json<Value>,
    ) -> Json<Value> {
        events.lock().unwrap().push(event);
        Json(json!({"ok": true}))
    }

    /// Runs a partner-side server that serves an agent profile and records
    /// the events posted to its webhook URL.
    async fn spawn_receiver() -> (String, Arc<Mutex<Vec<Value>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind receiver");
        let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        let events: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

        let app = Router::new()
            .route("/profile", get(receiver_profile))
            .route("/events", post(receiver_event))
            .layer(Extension(events.clone()))
            .layer(Extension(ReceiverConfig {
                webhook_url: format!("{base}/events"),
            }));

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Receiver failed");
        });

        (base, events)
    }

    async fn wait_for_events(events: &Arc<Mutex<Vec<Value>>>, count: usize) -> Vec<Value> {
        for _ in 0..50 {
            {
                let guard = events.lock().unwrap();
                if guard.len() >= count {
                    return guard.clone();
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        panic!(
            "Expected {count} webhook events, got {}",
            events.lock().unwrap().len()
        );
    }

    #[tokio::test]
    async fn test_webhook_notifications_for_placed_and_shipped() {
        seed_product("aster_s15", "Purple Aster", 1100, 10).await;
        let (receiver_base, events) = spawn_receiver().await;
        let client = reqwest::Client::new();

        let agent = format!("profile=\"{receiver_base}/profile\"; version=\"2026-01-11\"");
        let payload = checkout_payload("chk_s15", &[("aster_s15", "Purple Aster", 1100, 1)]);
        let res = client
            .post(format!("{}/checkout-sessions", context().base_url))
            .header("UCP-Agent", &agent)
            .header("Request-Signature", "test")
            .header("Request-Id", "s15-create")
            .header("Idempotency-Key", "s15-create")
            .json(&payload)
            .send()
            .await
            .expect("Failed to create");
        assert_eq!(res.status(), 201);
        let body: Value = res.json().await.expect("body");
        assert_eq!(
            body["platform"]["webhook_url"],
            format!("{receiver_base}/events"),
            "webhook URL must be captured from the agent profile"
        );

        let res = complete_checkout(&client, "chk_s15", &complete_payload("success_token"), "s15-complete").await;
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");
        let order_id = body["order"]["id"].as_str().unwrap().to_string();

        let delivered = wait_for_events(&events, 1).await;
        assert_eq!(delivered[0]["event_type"], "order_placed");
        assert_eq!(delivered[0]["checkout_id"], "chk_s15");
        assert_eq!(delivered[0]["order"]["id"], order_id.as_str());

        // Shipping triggers order_shipped.
        let res = with_headers(
            client.post(format!("{}/testing/simulate-shipping/{order_id}", context().base_url)),
            "s15-ship",
        )
        .header("Simulation-Secret", SIMULATION_SECRET)
        .send()
        .await
        .expect("Failed to ship");
        assert_eq!(res.status(), 200);

        let delivered = wait_for_events(&events, 2).await;
        assert_eq!(delivered[1]["event_type"], "order_shipped");
        assert_eq!(
            delivered[1]["order"]["fulfillment"]["events"][0]["type"],
            "shipped"
        );
    }

    #[tokio::test]
    async fn test_inbound_order_event_overwrites() {
        seed_product("zinnia_s16", "Zinnia", 700, 10).await;
        let client = reqwest::Client::new();

        let payload = checkout_payload("chk_s16", &[("zinnia_s16", "Zinnia", 700, 1)]);
        assert_eq!(create_checkout(&client, &payload, "s16-create").await.status(), 201);
        let res = complete_checkout(&client, "chk_s16", &complete_payload("success_token"), "s16-complete").await;
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");
        let order_id = body["order"]["id"].as_str().unwrap().to_string();

        let res = with_headers(
            client.get(format!("{}/orders/{order_id}", context().base_url)),
            "s16-get",
        )
        .send()
        .await
        .expect("Failed to get order");
        let mut order: Value = res.json().await.expect("order body");
        order["line_items"][0]["status"] = json!("delivered");

        // Partner callback: last writer wins.
        let res = client
            .post(format!(
                "{}/webhooks/partners/partner-1/events/order",
                context().base_url
            ))
            .header("Request-Signature", "test")
            .json(&order)
            .send()
            .await
            .expect("Failed to post order event");
        assert_eq!(res.status(), 200);
        let body: Value = res.json().await.expect("body");
        assert_eq!(body["status"], "ok");

        let res = with_headers(
            client.get(format!("{}/orders/{order_id}", context().base_url)),
            "s16-get-2",
        )
        .send()
        .await
        .expect("Failed to get order");
        let order: Value = res.json().await.expect("order body");
        assert_eq!(order["line_items"][0]["status"], "delivered");
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_discovery_profile_substitution() {
        let client = reqwest::Client::new();
        let res = client
            .get(format!("{}/.well-known/ucp", context().base_url))
            .send()
            .await
            .expect("Failed to get discovery profile");
        assert_eq!(res.status(), 200);

        let text = res.text().await.expect("profile text");
        assert!(!text.contains("{{ENDPOINT}}"));
        assert!(!text.contains("{{SHOP_ID}}"));

        let profile: Value = serde_json::from_str(&text).expect("profile json");
        assert_eq!(profile["ucp"]["version"], "2026-01-11");
        assert_eq!(profile["shop"]["endpoint"], context().base_url.as_str());
    }
}
