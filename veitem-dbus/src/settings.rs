//! Settings declared on the remote settings service
//!
//! `AddSettings` creates settings that do not exist yet and answers with the
//! current value of each, so declaring is also the first fetch.

use std::collections::BTreeMap;

use veitem::{SettingInfo, Value};

use crate::message::{MethodCall, SETTINGS_INTERFACE, SETTINGS_PATH, SETTINGS_SERVICE};
use crate::wire::{denormalize, normalize, WireValue};

/// Build the `AddSettings` call for a list of declarations
pub fn add_settings_call(infos: &[SettingInfo]) -> MethodCall {
    let settings = infos.iter().map(setting_to_wire).collect();
    MethodCall::new(SETTINGS_SERVICE, SETTINGS_PATH, SETTINGS_INTERFACE, "AddSettings")
        .with_arg(WireValue::Array(settings))
}

fn setting_to_wire(info: &SettingInfo) -> WireValue {
    let mut entry = BTreeMap::new();
    entry.insert(
        "path".to_string(),
        WireValue::variant(WireValue::Str(info.path.trim_start_matches('/').to_string())),
    );
    entry.insert("default".to_string(), WireValue::variant(denormalize(&info.default)));
    if info.min.is_valid() {
        entry.insert("min".to_string(), WireValue::variant(denormalize(&info.min)));
    }
    if info.max.is_valid() {
        entry.insert("max".to_string(), WireValue::variant(denormalize(&info.max)));
    }
    if info.silent {
        entry.insert("silent".to_string(), WireValue::variant(WireValue::Int32(1)));
    }
    WireValue::Dict(entry)
}

/// Successful entries of an `AddSettings` reply as `(path, value)`
///
/// Entries with a non-zero `error` or without a path are skipped.
pub fn parse_add_settings_reply(args: &[WireValue]) -> Vec<(String, Value)> {
    let Some(WireValue::Array(entries)) = args.first().map(WireValue::unwrap_variant) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let WireValue::Dict(fields) = entry.unwrap_variant() else {
                return None;
            };
            let error = fields.get("error").and_then(WireValue::as_i64).unwrap_or(-1);
            let path = fields.get("path").and_then(WireValue::as_str).unwrap_or("");
            if error != 0 || path.is_empty() {
                return None;
            }
            let value = fields.get("value").map(normalize).unwrap_or(Value::Invalid);
            Some((path.trim_start_matches('/').to_string(), value))
        })
        .collect()
}
