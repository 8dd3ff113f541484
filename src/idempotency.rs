//! Request fingerprinting for the idempotency guard.
//!
//! A fingerprint is the SHA-256 of the canonical JSON of the command body:
//! UTF-8, object keys sorted lexicographically, `null` values dropped at
//! every level. Divergence here silently breaks replay detection across
//! reimplementations, so the canonical form is pinned by tests.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Strips `null` members from objects, recursively. Array elements are kept
/// in place (a `null` element is positional data, not an absent field).
fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Canonical JSON text of `value`. serde_json's object map is ordered, so
/// re-serializing after the null-strip yields lexicographically sorted keys.
pub fn canonical_json(value: &Value) -> String {
    strip_nulls(value.clone()).to_string()
}

/// SHA-256 fingerprint (lowercase hex) of a command body.
pub fn request_hash<T: Serialize>(body: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(body)?;
    let canonical = canonical_json(&value);
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        let v = json!({"zeta": 1, "alpha": {"nested_b": 2, "nested_a": 3}});
        assert_eq!(
            canonical_json(&v),
            r#"{"alpha":{"nested_a":3,"nested_b":2},"zeta":1}"#
        );
    }

    #[test]
    fn nulls_are_dropped_from_objects_but_not_arrays() {
        let v = json!({"a": null, "b": [1, null, {"c": null, "d": 4}]});
        assert_eq!(canonical_json(&v), r#"{"b":[1,null,{"d":4}]}"#);
    }

    #[test]
    fn hash_is_stable_and_discriminating() {
        let a = json!({"currency": "USD", "line_items": [{"quantity": 2}]});
        let b = json!({"line_items": [{"quantity": 2}], "currency": "USD"});
        let c = json!({"currency": "USD", "line_items": [{"quantity": 3}]});

        let ha = request_hash(&a).unwrap();
        let hb = request_hash(&b).unwrap();
        let hc = request_hash(&c).unwrap();
        assert_eq!(ha, hb, "key order must not affect the fingerprint");
        assert_ne!(ha, hc, "different payloads must not collide");
        assert_eq!(ha.len(), 64);
    }

    #[test]
    fn empty_body_hash_matches_cancel_token() {
        // Cancel fingerprints the empty object, making the key alone the
        // deduplication token.
        let h = request_hash(&json!({})).unwrap();
        assert_eq!(h, request_hash(&json!({})).unwrap());
    }
}
