use serde_json::Value;
use serde_json::json;

use super::DiagralEntryConfig;
use super::coordinator::CoordinatorData;

const REDACTED: &str = "**REDACTED**";

const TO_REDACT: [&str; 6] = [
    "api_key",
    "password",
    "pin_code",
    "secret_key",
    "username",
    "webhook_id",
];

/// Replace the value of every sensitive key, at any depth.
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if TO_REDACT.contains(&key.as_str()) {
                    if !value.is_null() {
                        *value = json!(REDACTED);
                    }
                } else {
                    redact(value);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

/// Redacted snapshot of one entry.
pub fn entry_diagnostics(
    entry: &str,
    config: &DiagralEntryConfig,
    webhook_id: Option<&str>,
    webhook_url: Option<&str>,
    data: Option<&CoordinatorData>,
) -> Value {
    // The id is the only secret part of the URL
    let webhook_url = match (webhook_url, webhook_id) {
        (Some(url), Some(id)) => Some(url.replace(id, REDACTED)),
        (url, _) => url.map(str::to_string),
    };

    let mut info = json!({
        "entry": entry,
        "config": {
            "serial_id": config.serial_id,
            "username": config.username,
            "password": config.password,
            "pin_code": config.pin_code,
            "api_key": config.keys.as_ref().map(|k| &k.api_key),
            "secret_key": config.keys.as_ref().map(|k| &k.secret_key),
            "alarmpanel_actiontype_code": config.alarmpanel_actiontype_code,
            "scan_interval_secs": config.scan_interval.as_secs(),
            "api_base_url": config.api_base_url,
        },
        "webhook_id": webhook_id,
        "webhook_url": webhook_url,
        "data": data,
    });
    redact(&mut info);
    json!({ "info": info })
}
