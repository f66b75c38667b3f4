//! Recursive redaction of sensitive fields before an error payload is
//! logged or returned, per spec.md §7 "Sensitive data".

const SENTINEL: &str = "[redacted]";

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    matches!(
        lowered.as_str(),
        "apikey" | "api_key" | "secret" | "password" | "token" | "privatekey" | "private_key"
    )
}

/// Walk `value` recursively, replacing any object value whose key matches
/// the sensitive-field name list (case-insensitive) with a fixed sentinel.
pub fn redact_sensitive(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *v = serde_json::Value::String(SENTINEL.to_string());
                } else {
                    redact_sensitive(v);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                redact_sensitive(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_top_level_api_key() {
        let mut value = json!({ "apiKey": "sk-live-123", "chain": "1" });
        redact_sensitive(&mut value);
        assert_eq!(value["apiKey"], json!("[redacted]"));
        assert_eq!(value["chain"], json!("1"));
    }

    #[test]
    fn redacts_nested_secret_in_array() {
        let mut value = json!({ "accounts": [{ "password": "hunter2" }, { "name": "ok" }] });
        redact_sensitive(&mut value);
        assert_eq!(value["accounts"][0]["password"], json!("[redacted]"));
        assert_eq!(value["accounts"][1]["name"], json!("ok"));
    }

    #[test]
    fn case_insensitive_match() {
        let mut value = json!({ "PrivateKey": "0xdeadbeef" });
        redact_sensitive(&mut value);
        assert_eq!(value["PrivateKey"], json!("[redacted]"));
    }
}
