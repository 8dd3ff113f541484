//! Domain models for the UCP merchant server.
//!
//! The checkout session is the central aggregate; it is persisted as a JSON
//! body keyed by id and status, so every type here derives both `Serialize`
//! and `Deserialize`. Optional fields carry `skip_serializing_if` so absent
//! values are dropped from response bodies and idempotency fingerprints
//! alike.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Enumerations
// ============================================================================

/// Lifecycle states of a checkout session.
///
/// `requires_escalation` and `complete_in_progress` are part of the protocol
/// vocabulary but are never entered by this reference flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Incomplete,
    RequiresEscalation,
    ReadyForComplete,
    CompleteInProgress,
    Completed,
    Canceled,
}

impl CheckoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::RequiresEscalation => "requires_escalation",
            Self::ReadyForComplete => "ready_for_complete",
            Self::CompleteInProgress => "complete_in_progress",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal sessions reject every mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

/// Typed subtotal rows. The trailing entry of a session's `totals` is always
/// `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalType {
    Subtotal,
    Fulfillment,
    Discount,
    Total,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalEntry {
    #[serde(rename = "type")]
    pub kind: TotalType,
    pub amount: i64,
}

impl TotalEntry {
    pub fn new(kind: TotalType, amount: i64) -> Self {
        Self { kind, amount }
    }
}

// ============================================================================
// Checkout session (response shape, persisted as-is)
// ============================================================================

/// Protocol envelope stamped onto checkout and order responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UcpEnvelope {
    pub version: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: String,
}

impl UcpEnvelope {
    pub fn for_version(version: &str) -> Self {
        Self {
            version: version.to_string(),
            capabilities: vec![Capability {
                name: "dev.ucp.shopping.checkout".to_string(),
                version: version.to_string(),
            }],
        }
    }
}

/// A purchasable item with its authoritative catalog price in minor units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub item: Item,
    pub quantity: i64,
    pub totals: Vec<TotalEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buyer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// A shipping destination attached to a fulfillment method. Only the country
/// is needed for rate lookup; the full address is carried through to order
/// expectations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingDestination {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentOption {
    pub id: String,
    pub title: String,
    pub totals: Vec<TotalEntry>,
}

impl FulfillmentOption {
    /// Amount of this option's trailing `total` entry.
    pub fn total_amount(&self) -> i64 {
        self.totals
            .iter()
            .find(|t| t.kind == TotalType::Total)
            .map(|t| t.amount)
            .unwrap_or(0)
    }
}

/// Within a method, a bundle of line items sharing a delivery option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentGroup {
    pub id: String,
    pub line_item_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<FulfillmentOption>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_option_id: Option<String>,
}

/// A delivery channel (shipping, pickup, digital) over a subset of line
/// items. `selected_destination_id` and `selected_option_id` are
/// back-references resolved by lookup, never embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub line_item_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<ShippingDestination>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_destination_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<FulfillmentGroup>>,
}

impl FulfillmentMethod {
    /// Resolves `selected_destination_id` to one of the method's
    /// destinations.
    pub fn selected_destination(&self) -> Option<&ShippingDestination> {
        let wanted = self.selected_destination_id.as_deref()?;
        self.destinations
            .as_deref()?
            .iter()
            .find(|d| d.id == wanted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fulfillment {
    pub methods: Vec<FulfillmentMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub path: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub amount: i64,
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Discounts {
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<Vec<AppliedDiscount>>,
}

/// A token credential (`{token}`) or raw card data (`{number, ...}`).
/// Untagged: the `token` field wins, otherwise a card number is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credential {
    Token(TokenCredential),
    Card(CardCredential),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCredential {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardCredential {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp_month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp_year: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInstrument {
    pub id: String,
    pub handler_id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_digits: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
}

/// Payment state carried on the session. Handler descriptors are negotiated
/// out of band; the server always echoes an empty list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentInfo {
    #[serde(default)]
    pub handlers: Vec<Value>,
    #[serde(default)]
    pub instruments: Vec<PaymentInstrument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_instrument_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub id: String,
    pub permalink_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// The central aggregate: an in-progress purchase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub ucp: UcpEnvelope,
    pub id: String,
    pub status: CheckoutStatus,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer: Option<Buyer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<Fulfillment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discounts: Option<Discounts>,
    pub payment: PaymentInfo,
    pub totals: Vec<TotalEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderConfirmation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformConfig>,
}

// ============================================================================
// Order (materialised at completion, then independently mutable)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostalAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_country: Option<String>,
}

impl PostalAddress {
    pub fn from_destination(dest: &ShippingDestination) -> Self {
        Self {
            street_address: dest.street_address.clone(),
            address_locality: dest.address_locality.clone(),
            address_region: dest.address_region.clone(),
            postal_code: dest.postal_code.clone(),
            address_country: dest.address_country.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectationLineItem {
    pub id: String,
    pub quantity: i64,
}

/// A planned delivery: the selected option of one method/group pair applied
/// to the group's line items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expectation {
    pub id: String,
    pub line_items: Vec<ExpectationLineItem>,
    pub method_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PostalAddress>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderQuantity {
    pub total: i64,
    pub fulfilled: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub id: String,
    pub item: Item,
    pub quantity: OrderQuantity,
    pub totals: Vec<TotalEntry>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFulfillment {
    pub expectations: Vec<Expectation>,
    pub events: Vec<FulfillmentEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub ucp: UcpEnvelope,
    pub id: String,
    pub checkout_id: String,
    pub permalink_url: String,
    pub currency: String,
    pub line_items: Vec<OrderLineItem>,
    pub totals: Vec<TotalEntry>,
    pub fulfillment: OrderFulfillment,
}

// ============================================================================
// Request models (deserialized from JSON input; serialized only for
// idempotency fingerprinting)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemCreate {
    pub item: ItemRef,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub item: ItemRef,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentGroupRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_item_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_option_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentMethodRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_item_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<DestinationRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_destination_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<FulfillmentGroupRequest>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<FulfillmentMethodRequest>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentCreate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handlers: Option<Vec<Value>>,
    #[serde(default)]
    pub instruments: Vec<PaymentInstrument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_instrument_id: Option<String>,
}

/// Request body for creating a checkout session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutCreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub currency: String,
    pub line_items: Vec<LineItemCreate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer: Option<Buyer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<FulfillmentRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discounts: Option<DiscountsRequest>,
    #[serde(default)]
    pub payment: PaymentCreate,
}

/// Request body for a partial checkout update. Absent fields preserve prior
/// values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutUpdateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_items: Option<Vec<LineItemUpdate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer: Option<Buyer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentCreate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<FulfillmentRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discounts: Option<DiscountsRequest>,
}

/// Request body for completing a checkout: a single payment instrument plus
/// risk signals and an optional AP2 mandate, both passed through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub payment_data: PaymentInstrument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_signals: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ap2: Option<Value>,
}

/// Internal shape handed to the payment dispatcher and fingerprinted for
/// complete idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCreateRequest {
    pub instruments: Vec<PaymentInstrument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_instrument_id: Option<String>,
}
