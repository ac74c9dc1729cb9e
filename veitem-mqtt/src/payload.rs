//! JSON payloads
//!
//! Notifications carry `{"value": ..., "min": ..., "max": ..., "default": ...}`
//! where only `value` is always present. An empty payload means the item is
//! gone.

use serde::Deserialize;
use serde_json::json;
use veitem::Value;

use crate::error::Result;

#[derive(Debug, Deserialize)]
struct RawUpdate {
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    min: Option<serde_json::Value>,
    #[serde(default)]
    max: Option<serde_json::Value>,
    #[serde(default)]
    default: Option<serde_json::Value>,
}

/// A value notification with its optional side properties
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    pub value: Value,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Empty payload
    Removed,
    Update(Update),
}

pub fn parse_notification(payload: &[u8]) -> Result<Notification> {
    if payload.is_empty() {
        return Ok(Notification::Removed);
    }
    let raw: RawUpdate = serde_json::from_slice(payload)?;
    Ok(Notification::Update(Update {
        value: Value::from(raw.value),
        min: raw.min.map(Value::from),
        max: raw.max.map(Value::from),
        default: raw.default.map(Value::from),
    }))
}

/// Payload of a `W/` write
pub fn write_payload(value: &Value) -> Vec<u8> {
    json!({ "value": serde_json::Value::from(value) }).to_string().into_bytes()
}

/// Keepalive asking for a full republish, echoed back once it is done
pub fn keepalive_with_echo(token: &str) -> Vec<u8> {
    json!({ "keepalive-options": [{ "full-publish-completed-echo": token }] })
        .to_string()
        .into_bytes()
}

/// Periodic keepalive that only keeps notifications flowing
pub fn keepalive_suppress_republish() -> Vec<u8> {
    json!({ "keepalive-options": ["suppress-republish"] }).to_string().into_bytes()
}

/// The `value` string of a payload, e.g. the serial on `system/0/Serial`
pub fn string_value(payload: &[u8]) -> Option<String> {
    let raw: serde_json::Value = serde_json::from_slice(payload).ok()?;
    raw.get("value")?.as_str().map(str::to_string)
}

/// Echo token of a `full_publish_completed` notification
pub fn publish_completed_echo(payload: &[u8]) -> Option<String> {
    let raw: serde_json::Value = serde_json::from_slice(payload).ok()?;
    raw.get("full-publish-completed-echo")?.as_str().map(str::to_string)
}
