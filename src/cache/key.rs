//! Structured cache-entry keys.
//!
//! A key is the operation name plus its parameters in canonical form:
//! identical argument sets always hash and compare equal, regardless of the
//! order object keys were inserted in. This replaces stringly-typed key
//! concatenation and its formatting ambiguities.

use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Key identifying one cache entry: operation name + canonicalized params.
#[derive(Debug, Clone)]
pub struct QueryKey {
    operation: String,
    params: Value,
    /// Canonical rendering; equality and hashing are defined over this.
    canon: String,
}

impl QueryKey {
    pub fn new(operation: impl Into<String>, params: Value) -> Self {
        let operation = operation.into();
        let canon = format!("{}({})", operation, canonical_string(&params));
        Self {
            operation,
            params,
            canon,
        }
    }

    /// Key for an operation that takes no parameters.
    pub fn bare(operation: impl Into<String>) -> Self {
        Self::new(operation, Value::Null)
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Canonical form, also used as the real-time topic for this entry.
    pub fn canonical(&self) -> &str {
        &self.canon
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canon == other.canon
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canon.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canon)
    }
}

/// Render a JSON value with object keys recursively sorted.
fn canonical_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_string(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_string).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_key_order_independence() {
        let a = QueryKey::new("getPost", json!({"id": "42", "expand": true}));
        let b = QueryKey::new("getPost", json!({"expand": true, "id": "42"}));
        assert_eq!(a, b);

        let mut set = HashMap::new();
        set.insert(a, 1);
        assert!(set.contains_key(&b));
    }

    #[test]
    fn test_distinct_params_distinct_keys() {
        let a = QueryKey::new("getPost", json!({"id": "42"}));
        let b = QueryKey::new("getPost", json!({"id": "43"}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_nested_canonicalization() {
        let a = QueryKey::new("getFeed", json!({"filter": {"tag": "rust", "author": "ada"}}));
        let b = QueryKey::new("getFeed", json!({"filter": {"author": "ada", "tag": "rust"}}));
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_bare_key() {
        let key = QueryKey::bare("getNotifications");
        assert_eq!(key.operation(), "getNotifications");
        assert_eq!(key, QueryKey::new("getNotifications", Value::Null));
    }
}
