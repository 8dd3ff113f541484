//! The checkout engine.
//!
//! Orchestrates the session lifecycle: idempotent command processing,
//! authoritative totals recomputation, inventory validation, atomic
//! reservation coupled to order materialisation, and webhook notification
//! after commit.
//!
//! Every state-mutating command runs on one `BEGIN IMMEDIATE` transaction
//! against the transactions database: the idempotency record, the session
//! body, and (for complete) the order and inventory decrements commit
//! together or not at all. Taking the write lock up front keeps concurrent
//! completes serialized so the losing contender observes the winner's
//! decrement and fails its conditional reserve cleanly.

use std::collections::HashMap;

use axum::http::StatusCode;
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::config;
use crate::db;
use crate::error::UcpError;
use crate::idempotency;
use crate::models::{
    Allocation, AppliedDiscount, CheckoutCreateRequest, CheckoutSession, CheckoutStatus,
    CheckoutUpdateRequest, CompleteRequest, DestinationRequest, Discounts, DiscountsRequest,
    Expectation, ExpectationLineItem, Fulfillment, FulfillmentGroup, FulfillmentGroupRequest,
    FulfillmentMethod, FulfillmentMethodRequest, FulfillmentOption, FulfillmentRequest, Item,
    LineItem, Order, OrderConfirmation, OrderFulfillment, OrderLineItem, OrderQuantity,
    PaymentCreateRequest, PaymentInfo, PlatformConfig, PostalAddress, ShippingDestination,
    TotalEntry, TotalType, UcpEnvelope,
};
use crate::services::fulfillment::FulfillmentService;
use crate::services::payment;
use crate::services::webhook::WebhookNotifier;
use crate::AppState;

/// Outcome of a command: the HTTP status and the exact body to serve. The
/// body is the same value persisted in the idempotency record, so replays
/// are byte-identical.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl CommandResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }
}

pub struct CheckoutService {
    products: SqlitePool,
    transactions: SqlitePool,
    base_url: String,
    fulfillment: FulfillmentService,
    notifier: WebhookNotifier,
}

impl CheckoutService {
    pub fn new(state: &AppState) -> Self {
        Self {
            products: state.products.clone(),
            transactions: state.transactions.clone(),
            base_url: state.config.base_url.clone(),
            fulfillment: FulfillmentService,
            notifier: state.notifier.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Creates a new checkout session.
    pub async fn create_checkout(
        &self,
        req: CheckoutCreateRequest,
        idempotency_key: &str,
        platform: Option<PlatformConfig>,
    ) -> Result<CommandResponse, UcpError> {
        info!("Creating checkout session");

        let request_hash = idempotency::request_hash(&req)?;
        let mut tx = self.transactions.begin_with("BEGIN IMMEDIATE").await?;
        if let Some(cached) = check_idempotency(&mut tx, idempotency_key, &request_hash).await? {
            return Ok(cached);
        }

        let checkout_id = req
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let line_items: Vec<LineItem> = req
            .line_items
            .iter()
            .map(|li| LineItem {
                id: Uuid::new_v4().to_string(),
                item: Item {
                    id: li.item.id.clone(),
                    title: li.item.title.clone().unwrap_or_default(),
                    // Overwritten by recomputation; the server never trusts
                    // client prices.
                    price: 0,
                },
                quantity: li.quantity,
                totals: Vec::new(),
                parent_id: None,
            })
            .collect();

        let all_line_item_ids: Vec<String> = line_items.iter().map(|li| li.id.clone()).collect();
        let fulfillment = req
            .fulfillment
            .as_ref()
            .map(|f| init_fulfillment(f, &all_line_item_ids));

        let mut session = CheckoutSession {
            ucp: UcpEnvelope::for_version(config::server_version()),
            id: checkout_id,
            status: CheckoutStatus::Incomplete,
            currency: req.currency.clone(),
            line_items,
            buyer: req.buyer.clone(),
            fulfillment,
            discounts: req.discounts.as_ref().map(discounts_from_request),
            payment: PaymentInfo {
                handlers: Vec::new(),
                instruments: req.payment.instruments.clone(),
                selected_instrument_id: req.payment.selected_instrument_id.clone(),
            },
            totals: Vec::new(),
            order: None,
            platform,
        };

        self.recalculate_totals(&mut tx, &mut session).await?;
        self.validate_inventory(&mut tx, &session).await?;
        session.status = CheckoutStatus::ReadyForComplete;

        let body = serde_json::to_value(&session)?;
        db::save_checkout(&mut *tx, &session.id, session.status, &body).await?;
        db::save_idempotency_record(&mut *tx, idempotency_key, &request_hash, 201, &body).await?;
        tx.commit().await?;

        Ok(CommandResponse {
            status: StatusCode::CREATED,
            body,
        })
    }

    /// Retrieves a checkout session.
    pub async fn get_checkout(&self, checkout_id: &str) -> Result<CommandResponse, UcpError> {
        let mut tx = self.transactions.begin_with("BEGIN IMMEDIATE").await?;
        db::log_request(
            &mut *tx,
            "GET",
            &format!("/checkout-sessions/{checkout_id}"),
            Some(checkout_id),
            None,
        )
        .await?;
        tx.commit().await?;

        let body = db::get_checkout(&self.transactions, checkout_id)
            .await?
            .ok_or_else(|| UcpError::ResourceNotFound("Checkout session not found".into()))?;
        Ok(CommandResponse::ok(body))
    }

    /// Applies a partial update and re-derives the session state.
    pub async fn update_checkout(
        &self,
        checkout_id: &str,
        req: CheckoutUpdateRequest,
        idempotency_key: &str,
        platform: Option<PlatformConfig>,
    ) -> Result<CommandResponse, UcpError> {
        info!("Updating checkout session {checkout_id}");

        let request_hash = idempotency::request_hash(&req)?;
        let mut tx = self.transactions.begin_with("BEGIN IMMEDIATE").await?;
        if let Some(cached) = check_idempotency(&mut tx, idempotency_key, &request_hash).await? {
            return Ok(cached);
        }

        db::log_request(
            &mut *tx,
            "PUT",
            &format!("/checkout-sessions/{checkout_id}"),
            Some(checkout_id),
            Some(&serde_json::to_value(&req)?),
        )
        .await?;

        let mut session = load_session(&mut tx, checkout_id).await?;
        ensure_modifiable(&session, "update")?;
        session.status = CheckoutStatus::Incomplete;

        if let Some(line_items) = &req.line_items {
            session.line_items = line_items
                .iter()
                .map(|li| LineItem {
                    id: li.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
                    item: Item {
                        id: li.item.id.clone(),
                        title: li.item.title.clone().unwrap_or_default(),
                        price: 0,
                    },
                    quantity: li.quantity,
                    totals: Vec::new(),
                    parent_id: li.parent_id.clone(),
                })
                .collect();
        }
        if let Some(currency) = &req.currency {
            session.currency = currency.clone();
        }
        if let Some(payment) = &req.payment {
            session.payment = PaymentInfo {
                handlers: session.payment.handlers.clone(),
                instruments: payment.instruments.clone(),
                selected_instrument_id: payment.selected_instrument_id.clone(),
            };
        }
        if let Some(buyer) = &req.buyer {
            session.buyer = Some(buyer.clone());
        }

        if let Some(fulfillment_req) = &req.fulfillment {
            info!("Processing hierarchical fulfillment update for {checkout_id}");
            self.apply_fulfillment_update(&mut tx, &mut session, fulfillment_req)
                .await?;
        }

        if let Some(discounts) = &req.discounts {
            session.discounts = Some(discounts_from_request(discounts));
        }
        if platform.is_some() {
            session.platform = platform;
        }

        self.recalculate_totals(&mut tx, &mut session).await?;
        self.validate_inventory(&mut tx, &session).await?;
        session.status = CheckoutStatus::ReadyForComplete;

        let body = serde_json::to_value(&session)?;
        db::save_checkout(&mut *tx, checkout_id, session.status, &body).await?;
        db::save_idempotency_record(&mut *tx, idempotency_key, &request_hash, 200, &body).await?;
        tx.commit().await?;

        Ok(CommandResponse::ok(body))
    }

    /// Completes a checkout: payment, atomic inventory reservation, order
    /// materialisation, and the post-commit `order_placed` notification.
    pub async fn complete_checkout(
        &self,
        checkout_id: &str,
        req: CompleteRequest,
        idempotency_key: &str,
    ) -> Result<CommandResponse, UcpError> {
        info!("Completing checkout session {checkout_id}");

        let payment = PaymentCreateRequest {
            selected_instrument_id: Some(req.payment_data.id.clone()),
            instruments: vec![req.payment_data.clone()],
        };
        let combined = json!({
            "payment": payment,
            "risk_signals": req.risk_signals,
            "ap2": req.ap2,
        });
        let request_hash = idempotency::request_hash(&combined)?;

        let mut tx = self.transactions.begin_with("BEGIN IMMEDIATE").await?;
        if let Some(cached) = check_idempotency(&mut tx, idempotency_key, &request_hash).await? {
            return Ok(cached);
        }

        db::log_request(
            &mut *tx,
            "POST",
            &format!("/checkout-sessions/{checkout_id}/complete"),
            Some(checkout_id),
            Some(&combined),
        )
        .await?;

        let mut session = load_session(&mut tx, checkout_id).await?;
        ensure_modifiable(&session, "complete")?;

        // Prices and totals are refreshed against the catalog before any
        // money moves. The advisory stock check is skipped here; the atomic
        // reserve below is authoritative.
        self.recalculate_totals(&mut tx, &mut session).await?;

        payment::process_payment(&payment)?;

        if !has_complete_fulfillment(&session) {
            return Err(UcpError::InvalidRequest(
                "Fulfillment address and option must be selected before completion.".into(),
            ));
        }

        for line in &session.line_items {
            let reserved = db::reserve_stock(&mut *tx, &line.item.id, line.quantity).await?;
            if !reserved {
                return Err(UcpError::OutOfStock {
                    message: format!("Item {} is out of stock", line.item.id),
                    conflict: true,
                });
            }
        }

        let order_id = Uuid::new_v4().to_string();
        session.status = CheckoutStatus::Completed;
        session.order = Some(OrderConfirmation {
            id: order_id.clone(),
            permalink_url: format!("{}/orders/{order_id}", self.base_url),
        });

        let order = materialize_order(&session, &order_id);
        let order_body = serde_json::to_value(&order)?;
        let body = serde_json::to_value(&session)?;

        db::save_order(&mut *tx, &order_id, &order_body).await?;
        db::save_checkout(&mut *tx, checkout_id, session.status, &body).await?;
        db::save_idempotency_record(&mut *tx, idempotency_key, &request_hash, 200, &body).await?;
        tx.commit().await?;

        self.notify_webhook(&session, "order_placed").await;

        Ok(CommandResponse::ok(body))
    }

    /// Cancels a session. The fingerprint covers the empty object, so the
    /// idempotency key alone is the deduplication token.
    pub async fn cancel_checkout(
        &self,
        checkout_id: &str,
        idempotency_key: &str,
    ) -> Result<CommandResponse, UcpError> {
        info!("Canceling checkout session {checkout_id}");

        let request_hash = idempotency::request_hash(&json!({}))?;
        let mut tx = self.transactions.begin_with("BEGIN IMMEDIATE").await?;
        if let Some(cached) = check_idempotency(&mut tx, idempotency_key, &request_hash).await? {
            return Ok(cached);
        }

        db::log_request(
            &mut *tx,
            "POST",
            &format!("/checkout-sessions/{checkout_id}/cancel"),
            Some(checkout_id),
            None,
        )
        .await?;

        let mut session = load_session(&mut tx, checkout_id).await?;
        ensure_modifiable(&session, "cancel")?;
        session.status = CheckoutStatus::Canceled;

        let body = serde_json::to_value(&session)?;
        db::save_checkout(&mut *tx, checkout_id, session.status, &body).await?;
        db::save_idempotency_record(&mut *tx, idempotency_key, &request_hash, 200, &body).await?;
        tx.commit().await?;

        Ok(CommandResponse::ok(body))
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub async fn get_order(&self, order_id: &str) -> Result<CommandResponse, UcpError> {
        let body = db::get_order(&self.transactions, order_id)
            .await?
            .ok_or_else(|| UcpError::ResourceNotFound("Order not found".into()))?;
        Ok(CommandResponse::ok(body))
    }

    /// Replaces the stored order body after verifying existence.
    pub async fn update_order(
        &self,
        order_id: &str,
        order: Value,
    ) -> Result<CommandResponse, UcpError> {
        let mut tx = self.transactions.begin_with("BEGIN IMMEDIATE").await?;
        db::get_order(&mut *tx, order_id)
            .await?
            .ok_or_else(|| UcpError::ResourceNotFound("Order not found".into()))?;
        db::save_order(&mut *tx, order_id, &order).await?;
        tx.commit().await?;
        Ok(CommandResponse::ok(order))
    }

    /// Appends a `shipped` event to the order and notifies the webhook.
    /// Not idempotent: repeated calls append additional events.
    pub async fn ship_order(&self, order_id: &str) -> Result<(), UcpError> {
        let mut tx = self.transactions.begin_with("BEGIN IMMEDIATE").await?;
        let mut order = db::get_order(&mut *tx, order_id)
            .await?
            .ok_or_else(|| UcpError::ResourceNotFound("Order not found".into()))?;

        let event = json!({
            "id": format!("evt_{}", Uuid::new_v4()),
            "type": "shipped",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let root = order
            .as_object_mut()
            .ok_or_else(|| UcpError::InvalidRequest("Order body is not an object".into()))?;
        let fulfillment = root
            .entry("fulfillment")
            .or_insert_with(|| json!({"events": []}));
        if !fulfillment.is_object() {
            *fulfillment = json!({"events": []});
        }
        if let Some(fulfillment) = fulfillment.as_object_mut() {
            let events = fulfillment.entry("events").or_insert_with(|| json!([]));
            match events.as_array_mut() {
                Some(array) => array.push(event),
                None => *events = Value::Array(vec![event]),
            }
        }

        db::save_order(&mut *tx, order_id, &order).await?;
        tx.commit().await?;

        if let Some(checkout_id) = order.get("checkout_id").and_then(|v| v.as_str()) {
            let data = db::get_checkout(&self.transactions, checkout_id)
                .await?
                .ok_or_else(|| UcpError::ResourceNotFound("Checkout session not found".into()))?;
            let session: CheckoutSession = serde_json::from_value(data)?;
            self.notify_webhook(&session, "order_shipped").await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recomputation and validation
    // ------------------------------------------------------------------

    /// Recomputes line-item subtotals, fulfillment options and charges, and
    /// discounts from authoritative data. Safe to re-run: applied discounts
    /// and totals are rebuilt from scratch every pass.
    async fn recalculate_totals(
        &self,
        conn: &mut SqliteConnection,
        session: &mut CheckoutSession,
    ) -> Result<(), UcpError> {
        let mut grand_total: i64 = 0;

        for line in &mut session.line_items {
            let product = db::get_product(&self.products, &line.item.id)
                .await?
                .ok_or_else(|| {
                    UcpError::InvalidRequest(format!("Product {} not found", line.item.id))
                })?;
            line.item.price = product.price;
            line.item.title = product.title;

            let base_amount = product.price * line.quantity;
            line.totals = vec![
                TotalEntry::new(TotalType::Subtotal, base_amount),
                TotalEntry::new(TotalType::Total, base_amount),
            ];
            grand_total += base_amount;
        }

        session.totals = vec![TotalEntry::new(TotalType::Subtotal, grand_total)];

        let line_products: Vec<(String, String)> = session
            .line_items
            .iter()
            .map(|li| (li.id.clone(), li.item.id.clone()))
            .collect();
        let all_line_item_ids: Vec<String> =
            line_products.iter().map(|(id, _)| id.clone()).collect();

        let mut fulfillment_totals: Vec<TotalEntry> = Vec::new();
        if let Some(fulfillment) = session.fulfillment.as_mut() {
            if !fulfillment.methods.is_empty() {
                // Fetched once for the whole pass.
                let promotions = db::get_active_promotions(&self.products).await?;

                for method in fulfillment.methods.iter_mut() {
                    let mut calculated_options: Vec<FulfillmentOption> = Vec::new();
                    if method.kind == "shipping" {
                        if let Some(address) = method
                            .selected_destination()
                            .map(PostalAddress::from_destination)
                        {
                            let target_line_item_ids: &[String] = if method.line_item_ids.is_empty()
                            {
                                &all_line_item_ids
                            } else {
                                &method.line_item_ids
                            };
                            let product_ids: Vec<String> = target_line_item_ids
                                .iter()
                                .filter_map(|li_id| {
                                    line_products
                                        .iter()
                                        .find(|(id, _)| id == li_id)
                                        .map(|(_, product_id)| product_id.clone())
                                })
                                .collect();

                            calculated_options = self
                                .fulfillment
                                .calculate_options(
                                    &mut *conn,
                                    &address,
                                    &promotions,
                                    grand_total,
                                    &product_ids,
                                )
                                .await?;
                        }
                    }

                    if method.selected_destination_id.is_some() && method.groups.is_none() {
                        // A destination was chosen before any grouping:
                        // synthesise one group spanning the method's items.
                        method.groups = Some(vec![FulfillmentGroup {
                            id: format!("group_{}", Uuid::new_v4()),
                            line_item_ids: method.line_item_ids.clone(),
                            options: Some(calculated_options),
                            selected_option_id: None,
                        }]);
                    } else if let Some(groups) = method.groups.as_mut() {
                        for group in groups.iter_mut() {
                            if !calculated_options.is_empty() {
                                group.options = Some(calculated_options.clone());
                            }
                            if let (Some(selected), Some(options)) =
                                (group.selected_option_id.as_deref(), group.options.as_deref())
                            {
                                if let Some(option) = options.iter().find(|o| o.id == selected) {
                                    let amount = option.total_amount();
                                    grand_total += amount;
                                    fulfillment_totals
                                        .push(TotalEntry::new(TotalType::Fulfillment, amount));
                                }
                            }
                        }
                    }
                }
            }
        }
        session.totals.extend(fulfillment_totals);

        if session.discounts.is_none() {
            session.discounts = Some(Discounts::default());
        }
        let codes: Vec<String> = session
            .discounts
            .as_ref()
            .map(|d| d.codes.clone())
            .unwrap_or_default();

        let mut applied: Vec<AppliedDiscount> = Vec::new();
        let mut discount_totals: Vec<TotalEntry> = Vec::new();
        if !codes.is_empty() {
            let definitions = db::get_discounts_by_codes(&mut *conn, &codes).await?;
            let by_code: HashMap<&str, &db::Discount> =
                definitions.iter().map(|d| (d.code.as_str(), d)).collect();

            for code in &codes {
                // Codes absent from the catalog are silently skipped.
                let Some(definition) = by_code.get(code.as_str()) else {
                    continue;
                };
                let amount = match definition.kind.as_str() {
                    "percentage" => grand_total * definition.value / 100,
                    "fixed_amount" => definition.value,
                    _ => 0,
                };
                if amount > 0 {
                    grand_total -= amount;
                    applied.push(AppliedDiscount {
                        code: code.clone(),
                        title: definition.description.clone(),
                        amount,
                        allocations: vec![Allocation {
                            path: "$.totals[?(@.type=='subtotal')]".to_string(),
                            amount,
                        }],
                    });
                    discount_totals.push(TotalEntry::new(TotalType::Discount, amount));
                }
            }
        }
        if let Some(discounts) = session.discounts.as_mut() {
            discounts.applied = if applied.is_empty() { None } else { Some(applied) };
        }
        session.totals.extend(discount_totals);
        session.totals.push(TotalEntry::new(TotalType::Total, grand_total));

        Ok(())
    }

    /// Advisory stock check; authoritative only inside the reserve path of
    /// complete.
    async fn validate_inventory(
        &self,
        conn: &mut SqliteConnection,
        session: &CheckoutSession,
    ) -> Result<(), UcpError> {
        for line in &session.line_items {
            let available = db::get_inventory(&mut *conn, &line.item.id).await?;
            if available.map_or(true, |quantity| quantity < line.quantity) {
                return Err(UcpError::OutOfStock {
                    message: format!("Insufficient stock for item {}", line.item.id),
                    conflict: false,
                });
            }
        }
        Ok(())
    }

    /// Merges a partial fulfillment update into the session, persisting
    /// provided destinations for known buyers and falling back to the
    /// customer's address book when the session has none.
    async fn apply_fulfillment_update(
        &self,
        tx: &mut SqliteConnection,
        session: &mut CheckoutSession,
        fulfillment_req: &FulfillmentRequest,
    ) -> Result<(), UcpError> {
        let buyer_email = session.buyer.as_ref().and_then(|b| b.email.clone());
        let customer_addresses: Vec<ShippingDestination> = match buyer_email.as_deref() {
            Some(email) => db::get_customer_addresses(&mut *tx, email)
                .await?
                .into_iter()
                .map(|addr| ShippingDestination {
                    id: addr.id,
                    street_address: addr.street_address,
                    address_locality: addr.city,
                    address_region: addr.state,
                    postal_code: addr.postal_code,
                    address_country: addr.country,
                })
                .collect(),
            None => Vec::new(),
        };

        let methods_req: &[FulfillmentMethodRequest] =
            fulfillment_req.methods.as_deref().unwrap_or(&[]);

        let mut prepared: Vec<Option<Vec<ShippingDestination>>> =
            Vec::with_capacity(methods_req.len());
        for method_req in methods_req {
            match &method_req.destinations {
                Some(dest_reqs) => {
                    let mut destinations = Vec::with_capacity(dest_reqs.len());
                    for dest_req in dest_reqs {
                        let id = match buyer_email.as_deref() {
                            Some(email) => {
                                db::save_customer_address(&mut *tx, email, dest_req).await?
                            }
                            None => dest_req
                                .id
                                .clone()
                                .unwrap_or_else(|| Uuid::new_v4().to_string()),
                        };
                        let mut destination = destination_from_request(dest_req);
                        destination.id = id;
                        destinations.push(destination);
                    }
                    prepared.push(Some(destinations));
                }
                None => prepared.push(None),
            }
        }

        let all_line_item_ids: Vec<String> =
            session.line_items.iter().map(|li| li.id.clone()).collect();
        let merged = merge_fulfillment(
            session.fulfillment.as_ref(),
            &all_line_item_ids,
            methods_req,
            &prepared,
            &customer_addresses,
        );
        session.fulfillment = Some(merged);
        Ok(())
    }

    /// Best-effort notification carrying the freshly stored order body.
    async fn notify_webhook(&self, session: &CheckoutSession, event_type: &str) {
        let Some(url) = session
            .platform
            .as_ref()
            .and_then(|p| p.webhook_url.clone())
        else {
            return;
        };
        let order = match &session.order {
            Some(confirmation) => db::get_order(&self.transactions, &confirmation.id)
                .await
                .ok()
                .flatten(),
            None => None,
        };
        self.notifier.notify(&url, event_type, &session.id, order);
    }
}

// ----------------------------------------------------------------------
// Pure helpers
// ----------------------------------------------------------------------

async fn check_idempotency(
    conn: &mut SqliteConnection,
    key: &str,
    request_hash: &str,
) -> Result<Option<CommandResponse>, UcpError> {
    let Some(record) = db::get_idempotency_record(&mut *conn, key).await? else {
        return Ok(None);
    };
    if record.request_hash != request_hash {
        return Err(UcpError::IdempotencyConflict(
            "Idempotency key reused with different parameters".into(),
        ));
    }
    let body: Value = serde_json::from_str(&record.response_body)?;
    let status = u16::try_from(record.response_status)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    Ok(Some(CommandResponse { status, body }))
}

async fn load_session(
    conn: &mut SqliteConnection,
    checkout_id: &str,
) -> Result<CheckoutSession, UcpError> {
    let data = db::get_checkout(&mut *conn, checkout_id)
        .await?
        .ok_or_else(|| UcpError::ResourceNotFound("Checkout session not found".into()))?;
    Ok(serde_json::from_value(data)?)
}

fn ensure_modifiable(session: &CheckoutSession, action: &str) -> Result<(), UcpError> {
    if session.status.is_terminal() {
        return Err(UcpError::CheckoutNotModifiable(format!(
            "Cannot {action} checkout in state '{}'",
            session.status.as_str()
        )));
    }
    Ok(())
}

fn discounts_from_request(req: &DiscountsRequest) -> Discounts {
    Discounts {
        codes: req.codes.clone().unwrap_or_default(),
        applied: None,
    }
}

fn destination_from_request(req: &DestinationRequest) -> ShippingDestination {
    ShippingDestination {
        id: req.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
        street_address: req.street_address.clone(),
        address_locality: req.address_locality.clone(),
        address_region: req.address_region.clone(),
        postal_code: req.postal_code.clone(),
        address_country: req.address_country.clone(),
    }
}

/// Builds the fulfillment tree for a freshly created session.
fn init_fulfillment(req: &FulfillmentRequest, all_line_item_ids: &[String]) -> Fulfillment {
    let mut methods = Vec::new();
    for method_req in req.methods.as_deref().unwrap_or(&[]) {
        let groups: Vec<FulfillmentGroup> = method_req
            .groups
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|g| group_from_request(g, all_line_item_ids))
            .collect();
        let destinations: Vec<ShippingDestination> = method_req
            .destinations
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(destination_from_request)
            .collect();

        methods.push(FulfillmentMethod {
            id: method_req
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: method_req
                .kind
                .clone()
                .unwrap_or_else(|| "shipping".to_string()),
            line_item_ids: method_req
                .line_item_ids
                .clone()
                .unwrap_or_else(|| all_line_item_ids.to_vec()),
            destinations: if destinations.is_empty() {
                None
            } else {
                Some(destinations)
            },
            selected_destination_id: method_req.selected_destination_id.clone(),
            groups: if groups.is_empty() { None } else { Some(groups) },
        });
    }
    Fulfillment { methods }
}

fn group_from_request(req: &FulfillmentGroupRequest, all_line_item_ids: &[String]) -> FulfillmentGroup {
    FulfillmentGroup {
        id: req
            .id
            .clone()
            .unwrap_or_else(|| format!("group_{}", Uuid::new_v4())),
        line_item_ids: req
            .line_item_ids
            .clone()
            .unwrap_or_else(|| all_line_item_ids.to_vec()),
        options: None,
        selected_option_id: req.selected_option_id.clone(),
    }
}

/// Merges a partial fulfillment update over the existing tree.
///
/// Branches, pinned by tests: a method is matched by id, or by position when
/// the request omits the id and exactly one method exists; omitted
/// `destinations`/`groups` preserve prior values; explicit empty lists
/// replace. `prepared_destinations[i]` is the request's destination list for
/// method `i` after persistence, `None` when the request omitted it.
fn merge_fulfillment(
    existing: Option<&Fulfillment>,
    all_line_item_ids: &[String],
    methods_req: &[FulfillmentMethodRequest],
    prepared_destinations: &[Option<Vec<ShippingDestination>>],
    customer_addresses: &[ShippingDestination],
) -> Fulfillment {
    let existing_methods: &[FulfillmentMethod] =
        existing.map(|f| f.methods.as_slice()).unwrap_or(&[]);

    let mut methods = Vec::with_capacity(methods_req.len());
    for (index, method_req) in methods_req.iter().enumerate() {
        let matched = match &method_req.id {
            Some(id) => existing_methods.iter().find(|m| &m.id == id),
            None if existing_methods.len() == 1 => Some(&existing_methods[0]),
            None => None,
        };

        let method_id = method_req
            .id
            .clone()
            .or_else(|| matched.map(|m| m.id.clone()))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let kind = method_req
            .kind
            .clone()
            .unwrap_or_else(|| "shipping".to_string());
        let line_item_ids = method_req
            .line_item_ids
            .clone()
            .unwrap_or_else(|| all_line_item_ids.to_vec());

        let destinations = if kind == "shipping" {
            match prepared_destinations.get(index).and_then(|p| p.as_ref()) {
                Some(provided) if !provided.is_empty() => Some(provided.clone()),
                Some(_) => None, // explicit empty list clears
                None => match matched.and_then(|m| m.destinations.clone()) {
                    Some(kept) => Some(kept),
                    None if !customer_addresses.is_empty() => Some(customer_addresses.to_vec()),
                    None => None,
                },
            }
        } else {
            None
        };

        let groups = match &method_req.groups {
            Some(group_reqs) if !group_reqs.is_empty() => Some(
                group_reqs
                    .iter()
                    .map(|g| group_from_request(g, all_line_item_ids))
                    .collect(),
            ),
            Some(_) => None, // explicit empty list clears
            None => matched.and_then(|m| m.groups.clone()),
        };

        methods.push(FulfillmentMethod {
            id: method_id,
            kind,
            line_item_ids,
            destinations,
            selected_destination_id: method_req.selected_destination_id.clone(),
            groups,
        });
    }
    Fulfillment { methods }
}

/// Completion precondition: some method passes the destination gate (a
/// non-shipping method, or a shipping method with a selected destination)
/// and carries a group with a selected option.
fn has_complete_fulfillment(session: &CheckoutSession) -> bool {
    let Some(fulfillment) = &session.fulfillment else {
        return false;
    };
    for method in &fulfillment.methods {
        if method.kind == "shipping" && method.selected_destination_id.is_none() {
            continue;
        }
        if let Some(groups) = &method.groups {
            if groups.iter().any(|g| g.selected_option_id.is_some()) {
                return true;
            }
        }
    }
    false
}

/// Materialises the immutable order record from a completed session.
fn materialize_order(session: &CheckoutSession, order_id: &str) -> Order {
    let mut expectations = Vec::new();
    if let Some(fulfillment) = &session.fulfillment {
        for method in &fulfillment.methods {
            let destination = method
                .selected_destination()
                .map(PostalAddress::from_destination);
            let Some(groups) = &method.groups else {
                continue;
            };
            for group in groups {
                let selected = group
                    .selected_option_id
                    .as_deref()
                    .zip(group.options.as_deref())
                    .and_then(|(id, options)| options.iter().find(|o| o.id == id));
                let Some(option) = selected else {
                    continue;
                };

                let line_items: Vec<ExpectationLineItem> = session
                    .line_items
                    .iter()
                    .filter(|li| group.line_item_ids.contains(&li.id))
                    .map(|li| ExpectationLineItem {
                        id: li.id.clone(),
                        quantity: li.quantity,
                    })
                    .collect();

                expectations.push(Expectation {
                    id: format!("exp_{}", Uuid::new_v4()),
                    line_items,
                    method_type: method.kind.clone(),
                    destination: destination.clone(),
                    description: option.title.clone(),
                });
            }
        }
    }

    let line_items: Vec<OrderLineItem> = session
        .line_items
        .iter()
        .map(|li| OrderLineItem {
            id: li.id.clone(),
            item: li.item.clone(),
            quantity: OrderQuantity {
                total: li.quantity,
                fulfilled: 0,
            },
            totals: li.totals.clone(),
            status: "processing".to_string(),
            parent_id: li.parent_id.clone(),
        })
        .collect();

    Order {
        ucp: session.ucp.clone(),
        id: order_id.to_string(),
        checkout_id: session.id.clone(),
        permalink_url: session
            .order
            .as_ref()
            .map(|o| o.permalink_url.clone())
            .unwrap_or_default(),
        currency: session.currency.clone(),
        line_items,
        totals: session.totals.clone(),
        fulfillment: OrderFulfillment {
            expectations,
            events: Vec::new(),
        },
    }
}
