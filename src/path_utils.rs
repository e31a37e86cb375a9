// Dotted-path utilities for nested JSON lookups
// Consolidates the key-addressing logic used by the policy evaluator, the
// allocation engine, and request validation: a single dotted string like
// "user.contact.email" addresses a value inside a nested JSON object.

use serde_json::Value;

/// Errors that can occur while resolving a dotted path.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("{key} not found in request")]
    MissingKey { key: String },
}

/// Resolve a dotted path against a JSON object.
///
/// Every segment must index into an object; a missing segment or an attempt
/// to traverse through a scalar fails with [`PathError::MissingKey`] naming
/// the full requested path.
pub fn lookup<'a>(value: &'a Value, key: &str) -> Result<&'a Value, PathError> {
    let mut current = value;
    for segment in key.split('.') {
        current = current
            .as_object()
            .and_then(|map| map.get(segment))
            .ok_or_else(|| PathError::MissingKey {
                key: key.to_string(),
            })?;
    }
    Ok(current)
}

/// Enumerate every dotted path reachable in a JSON object, interior keys
/// included: for `{"a": {"b": 1}}` both `a` and `a.b` are returned.
///
/// Children are emitted before their parent key. `serde_json::Map` iterates
/// in key order, so two calls on the same input enumerate identically.
/// A non-object input yields nothing.
pub fn all_keys(value: &Value, prefix: Option<&str>) -> Vec<String> {
    let mut keys = Vec::new();
    let Some(map) = value.as_object() else {
        return keys;
    };
    for (key, child) in map {
        let current = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        if child.is_object() {
            keys.extend(all_keys(child, Some(&current)));
        }
        keys.push(current);
    }
    keys
}
