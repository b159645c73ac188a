use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fingerprint used for details that carry no structure (absent or scalar)
pub const EMPTY_FINGERPRINT: &str = "";

/// Derive the storage key for a (category, identifier) stream.
pub fn composite_key(category: &str, identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update(b":");
    hasher.update(identifier.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint the value of an event payload.
///
/// Object keys are sorted at every depth before hashing, so payloads that
/// differ only in field order fingerprint identically.
pub fn details_fingerprint(details: &Value) -> String {
    match details {
        Value::Object(_) | Value::Array(_) => {
            let mut canonical = String::new();
            write_canonical(details, &mut canonical);
            let mut hasher = Sha256::new();
            hasher.update(canonical.as_bytes());
            hex::encode(hasher.finalize())
        }
        _ => EMPTY_FINGERPRINT.to_string(),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
