//! Fulfillment evaluator: computes available delivery options for a
//! destination.
//!
//! Deterministic over its inputs: rates are bucketed by service level with
//! country-specific rates preferred over `default`, then sorted by price
//! (id as tie-break). A free-shipping promotion zeroes the `standard` level
//! and suffixes the title.

use std::collections::HashMap;

use sqlx::SqliteExecutor;

use crate::db::{self, Promotion, ShippingRate};
use crate::error::UcpError;
use crate::models::{FulfillmentOption, PostalAddress, TotalEntry, TotalType};

#[derive(Debug, Clone, Default)]
pub struct FulfillmentService;

impl FulfillmentService {
    /// Calculates the options offered to a group shipping to `address`.
    ///
    /// `subtotal` is the grand total accumulated so far and `product_ids`
    /// the products covered by the method, both consulted for free-shipping
    /// eligibility.
    pub async fn calculate_options<'e, E>(
        &self,
        ex: E,
        address: &PostalAddress,
        promotions: &[Promotion],
        subtotal: i64,
        product_ids: &[String],
    ) -> Result<Vec<FulfillmentOption>, UcpError>
    where
        E: SqliteExecutor<'e>,
    {
        let Some(country) = address.address_country.as_deref() else {
            return Ok(Vec::new());
        };

        let free_shipping = is_free_shipping(promotions, subtotal, product_ids);
        let rates = db::get_shipping_rates(ex, country).await?;
        Ok(build_options(rates, free_shipping))
    }
}

/// True when any `free_shipping` promotion is satisfied by the subtotal
/// threshold or by an eligible product in the method.
pub(crate) fn is_free_shipping(
    promotions: &[Promotion],
    subtotal: i64,
    product_ids: &[String],
) -> bool {
    promotions
        .iter()
        .filter(|p| p.kind == "free_shipping")
        .any(|p| {
            if p.min_subtotal.is_some_and(|min| subtotal >= min) {
                return true;
            }
            let eligible = p.eligible_item_ids();
            product_ids.iter().any(|id| eligible.contains(id))
        })
}

/// Buckets rates by service level (country-specific beats `default`), sorts
/// by price then id, and materialises each bucket into an option.
pub(crate) fn build_options(rates: Vec<ShippingRate>, free_shipping: bool) -> Vec<FulfillmentOption> {
    let mut by_level: HashMap<String, ShippingRate> = HashMap::new();
    for rate in rates {
        let replace = match by_level.get(&rate.service_level) {
            Some(existing) => existing.country_code == "default" && rate.country_code != "default",
            None => true,
        };
        if replace {
            by_level.insert(rate.service_level.clone(), rate);
        }
    }

    let mut picked: Vec<ShippingRate> = by_level.into_values().collect();
    picked.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.id.cmp(&b.id)));

    picked
        .into_iter()
        .map(|rate| {
            let (price, title) = if free_shipping && rate.service_level == "standard" {
                (0, format!("{} (Free)", rate.title))
            } else {
                (rate.price, rate.title)
            };
            FulfillmentOption {
                id: rate.id,
                title,
                totals: vec![
                    TotalEntry::new(TotalType::Subtotal, price),
                    TotalEntry::new(TotalType::Total, price),
                ],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(id: &str, country: &str, level: &str, price: i64) -> ShippingRate {
        ShippingRate {
            id: id.to_string(),
            country_code: country.to_string(),
            service_level: level.to_string(),
            price,
            title: format!("{level} shipping"),
        }
    }

    fn promo(kind: &str, min_subtotal: Option<i64>, eligible: Option<&[&str]>) -> Promotion {
        Promotion {
            id: "promo_1".into(),
            kind: kind.to_string(),
            min_subtotal,
            eligible_item_ids: eligible
                .map(|ids| serde_json::to_string(&ids.to_vec()).unwrap()),
            description: None,
        }
    }

    #[test]
    fn country_rate_beats_default_within_a_level() {
        let options = build_options(
            vec![
                rate("default-std", "default", "standard", 700),
                rate("us-std", "US", "standard", 500),
                rate("default-exp", "default", "express", 1500),
            ],
            false,
        );
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].id, "us-std");
        assert_eq!(options[0].total_amount(), 500);
        assert_eq!(options[1].id, "default-exp");
    }

    #[test]
    fn options_sort_by_price_then_id() {
        let options = build_options(
            vec![
                rate("b-pickup", "US", "pickup", 500),
                rate("a-std", "US", "standard", 500),
                rate("c-exp", "US", "express", 1500),
            ],
            false,
        );
        let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a-std", "b-pickup", "c-exp"]);
    }

    #[test]
    fn free_shipping_zeroes_standard_only() {
        let options = build_options(
            vec![rate("std", "US", "standard", 500), rate("exp", "US", "express", 1500)],
            true,
        );
        assert_eq!(options[0].total_amount(), 0);
        assert_eq!(options[0].title, "standard shipping (Free)");
        assert_eq!(options[1].total_amount(), 1500);
        assert_eq!(options[1].title, "express shipping");
    }

    #[test]
    fn free_shipping_by_subtotal_threshold() {
        let promos = vec![promo("free_shipping", Some(5000), None)];
        assert!(is_free_shipping(&promos, 5000, &[]));
        assert!(!is_free_shipping(&promos, 4999, &[]));
    }

    #[test]
    fn free_shipping_by_eligible_item() {
        let promos = vec![promo("free_shipping", None, Some(&["orchid"]))];
        assert!(is_free_shipping(&promos, 0, &["orchid".to_string()]));
        assert!(!is_free_shipping(&promos, 0, &["rose".to_string()]));
    }

    #[test]
    fn non_free_shipping_promotions_are_ignored() {
        let promos = vec![promo("loyalty_points", Some(0), None)];
        assert!(!is_free_shipping(&promos, 10_000, &[]));
    }
}
