//! Recursive masking of secrets in parsed configuration values.

use serde_json::Value;

/// Replacement written over every sensitive value.
pub const MASK: &str = "***MASKED***";

/// Key fragments treated as secrets after normalization.
const SENSITIVE: &[&str] = &[
    "apikey",
    "token",
    "password",
    "passwd",
    "secret",
    "downloadapikeys",
    "privatekey",
    "clientsecret",
    "authorization",
];

/// Lowercase and strip `_`, `-`, `.` and spaces so `Api_Key`, `api-key`
/// and `ApiKey` compare equal.
fn canonical(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '-' | '.' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// True when the canonical key ends in a sensitive fragment, singular or
/// plural (`ApiKeys`, `refresh_tokens`).
pub fn is_sensitive(key: &str) -> bool {
    let key = canonical(key);
    let stem = key.strip_suffix('s').unwrap_or(&key);
    SENSITIVE
        .iter()
        .any(|s| key.ends_with(s) || stem.ends_with(s))
}

/// Mask a sensitive value, keeping its shape where it is a list.
fn mask(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Array(items) => Value::Array(items.iter().map(|_| Value::from(MASK)).collect()),
        _ => Value::from(MASK),
    }
}

/// Return a copy of `value` with every sensitive key masked, at any depth.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive(k) { mask(v) } else { redact(v) };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}
