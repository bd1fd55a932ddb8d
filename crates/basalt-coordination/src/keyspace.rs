//! Redis key layout and the composite-key flattening rule shared by `Mutex`
//! and `Mesh`.
//!
//! All Redis keys this crate ever touches are rooted at a configured
//! `prefix` and namespaced by category: `${prefix}:${category}:${key}`.

use md5::{Digest, Md5};
use serde_json::Value;

/// A fully-qualified Redis key: `${prefix}:${category}:${key}`.
pub fn namespaced(prefix: &str, category: &str, key: &str) -> String {
    format!("{prefix}:{category}:{key}")
}

/// Flattens a composite lock/mesh key (as in the distilled spec's "Flatten
/// rule for composite keys") into the single string segment used in a Redis
/// key.
///
/// - primitives (string/number/bool/null) stringify directly
/// - arrays flatten each element and join with `:`
/// - an object with a `name` field uses that field's string value
/// - any other object falls back to the MD5 hex digest of its canonical
///   (key-sorted) JSON representation, UNLESS it serializes to `{}`, in
///   which case it falls back to `String(v)` (`"{}"`) like the distilled
///   spec's JS implementation does for an empty-JSON object
pub fn flatten_key(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(flatten_key)
            .collect::<Vec<_>>()
            .join(":"),
        Value::Object(map) => {
            if let Some(Value::String(name)) = map.get("name") {
                return name.clone();
            }
            if map.is_empty() {
                return "{}".to_string();
            }
            let canonical = canonical_json(value);
            let mut hasher = Md5::new();
            hasher.update(canonical.as_bytes());
            hex_encode(&hasher.finalize())
        }
    }
}

/// Serializes a `Value` with object keys sorted, so the MD5 fallback is
/// stable regardless of insertion order.
fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sorted(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespaced_joins_prefix_category_key() {
        assert_eq!(namespaced("app", "mutex", "orders"), "app:mutex:orders");
    }

    #[test]
    fn flatten_primitives() {
        assert_eq!(flatten_key(&json!("orders")), "orders");
        assert_eq!(flatten_key(&json!(42)), "42");
        assert_eq!(flatten_key(&json!(true)), "true");
        assert_eq!(flatten_key(&json!(null)), "null");
    }

    #[test]
    fn flatten_array_joins_with_colon() {
        assert_eq!(flatten_key(&json!(["orders", 7])), "orders:7");
        assert_eq!(flatten_key(&json!(["a", ["b", "c"]])), "a:b:c");
    }

    #[test]
    fn flatten_object_with_name_uses_name() {
        assert_eq!(flatten_key(&json!({"name": "Order", "id": 7})), "Order");
    }

    #[test]
    fn flatten_empty_object_falls_back_to_string() {
        assert_eq!(flatten_key(&json!({})), "{}");
    }

    #[test]
    fn flatten_plain_object_hashes_canonically() {
        let a = flatten_key(&json!({"b": 1, "a": 2}));
        let b = flatten_key(&json!({"a": 2, "b": 1}));
        assert_eq!(a, b, "key order must not affect the hash");
        assert_eq!(a.len(), 32, "MD5 hex digest is 32 chars");
    }
}
