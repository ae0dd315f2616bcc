//! Shared accessors over raw JSON resource snapshots.
//!
//! Remote resources keep their last response body as a `serde_json::Value`
//! and project typed fields out of it on demand. Servers of different
//! versions omit different fields, so accessors either require a field with
//! a contextual error or fall back to a documented default.

use anyhow::{Context, Result};
use serde_json::Value;

pub(crate) fn str_field(info: &Value, key: &str) -> Result<String> {
    info.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("snapshot has no string field `{key}`"))
}

pub(crate) fn u64_field(info: &Value, key: &str) -> Result<u64> {
    info.get(key)
        .and_then(Value::as_u64)
        .with_context(|| format!("snapshot has no integer field `{key}`"))
}

pub(crate) fn bool_field(info: &Value, key: &str) -> Result<bool> {
    info.get(key)
        .and_then(Value::as_bool)
        .with_context(|| format!("snapshot has no boolean field `{key}`"))
}

/// Field the server may omit depending on version or configuration.
pub(crate) fn bool_field_or(info: &Value, key: &str, default: bool) -> bool {
    info.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// String field that may be absent or `null`.
pub(crate) fn opt_str_field(info: &Value, key: &str) -> Option<String> {
    info.get(key).and_then(Value::as_str).map(str::to_string)
}
