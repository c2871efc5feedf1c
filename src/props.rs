//! Props parsing and sanitizing.
//!
//! Props arrive as opaque JSON text. Before they reach the engine they are
//! parsed and checked for keys like `__proto__`, `constructor` and
//! `prototype` that could pollute `Object.prototype` inside render functions.

use crate::error::PropsError;
use serde_json::{Map, Value};

/// Maximum recursion depth for nested objects/arrays
pub const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Parse props JSON text. Empty or whitespace-only text means `{}`.
pub fn parse_props(text: &str) -> Result<Value, PropsError> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_json::from_str(text)?;
    sanitize_props(value)
}

/// Recursively sanitize a JSON value, erroring if dangerous keys are found.
///
/// # Errors
/// Returns an error if:
/// - A dangerous key (`__proto__`, `constructor`, `prototype`) is found
/// - Nesting depth exceeds [`MAX_DEPTH`]
pub fn sanitize_props(value: Value) -> Result<Value, PropsError> {
    sanitize_recursive(value, 0)
}

fn sanitize_recursive(value: Value, depth: usize) -> Result<Value, PropsError> {
    if depth > MAX_DEPTH {
        return Err(PropsError::TooDeep(MAX_DEPTH));
    }

    match value {
        Value::Object(map) => {
            if let Some(key) = map.keys().find(|k| DANGEROUS_KEYS.contains(&k.as_str())) {
                return Err(PropsError::ForbiddenKey(key.clone()));
            }

            let mut sanitized = Map::new();
            for (key, val) in map {
                sanitized.insert(key, sanitize_recursive(val, depth + 1)?);
            }
            Ok(Value::Object(sanitized))
        }
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| sanitize_recursive(v, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other),
    }
}
