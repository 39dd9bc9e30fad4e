//! Storage value sanitization.
//!
//! Every value entering a CRDT document passes through here: strings are
//! stripped of angle brackets (recursively through arrays and objects)
//! and the whole value must serialize below [`MAX_VALUE_BYTES`].

use serde_json::Value;

use crate::error::EngineError;
use crate::limits::MAX_VALUE_BYTES;

/// Serialized length of a value in its canonical JSON form. Object keys
/// are ordered, so structurally equal values measure identically.
pub fn serialized_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Strip `<` and `>` from every string in the value tree, in place.
pub fn strip_tags(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains(['<', '>']) {
                s.retain(|c| c != '<' && c != '>');
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_tags(item);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                strip_tags(v);
            }
        }
        _ => {}
    }
}

/// Size-check then sanitize a value, consuming it. Oversize values fail
/// the enclosing operation; the caller must discard it.
pub fn sanitize(mut value: Value) -> Result<Value, EngineError> {
    let size = serialized_len(&value);
    if size > MAX_VALUE_BYTES {
        return Err(EngineError::ValueTooLarge { size });
    }
    strip_tags(&mut value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_tags_in_nested_values() {
        let mut value = json!({
            "title": "<b>hello</b>",
            "items": ["<script>", {"inner": "a < b > c"}],
            "count": 3,
        });
        strip_tags(&mut value);
        assert_eq!(
            value,
            json!({
                "title": "bhello/b",
                "items": ["script", {"inner": "a  b  c"}],
                "count": 3,
            })
        );
    }

    #[test]
    fn test_primitives_pass_through() {
        for v in [json!(null), json!(true), json!(42), json!(1.5)] {
            assert_eq!(sanitize(v.clone()).unwrap(), v);
        }
    }

    #[test]
    fn test_oversize_value_rejected() {
        let big = json!("x".repeat(60_000));
        match sanitize(big) {
            Err(EngineError::ValueTooLarge { size }) => assert!(size > MAX_VALUE_BYTES),
            other => panic!("expected ValueTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_value_at_limit_accepted() {
        // 49_998 chars + 2 quote bytes lands exactly on the cap.
        let value = json!("x".repeat(MAX_VALUE_BYTES - 2));
        assert!(sanitize(value).is_ok());
    }
}
