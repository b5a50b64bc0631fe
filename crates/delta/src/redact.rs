//! Blank out oversized string fields so a single huge column cannot blow up a
//! chat message.

use serde_json::Value;

/// Default per-field limit, in chars.
pub const DEFAULT_MAX_FIELD_LEN: usize = 128;

/// Replace every string longer than `max_field_len` chars with `""`, at any
/// depth, in place. Returns the same value for chaining.
pub fn redact(value: &mut Value, max_field_len: usize) -> &mut Value {
    match value {
        Value::String(s) => {
            if s.chars().count() > max_field_len {
                s.clear();
            }
        },
        Value::Array(items) => {
            for item in items {
                redact(item, max_field_len);
            }
        },
        Value::Object(map) => {
            for field in map.values_mut() {
                redact(field, max_field_len);
            }
        },
        Value::Null | Value::Bool(_) | Value::Number(_) => {},
    }
    value
}

/// Redacted copy of `value`.
#[must_use]
pub fn redacted(value: &Value, max_field_len: usize) -> Value {
    let mut copy = value.clone();
    redact(&mut copy, max_field_len);
    copy
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {rstest::rstest, serde_json::json};

    use super::*;

    #[test]
    fn blanks_long_strings_at_every_level() {
        let long = "x".repeat(10);
        let mut value = json!({
            "short": "ok",
            "long": long,
            "nested": {"deep": [long, "ok", {"again": long}]},
            "n": 12345678901_i64,
            "flag": true,
            "none": null
        });
        redact(&mut value, 5);
        assert_eq!(
            value,
            json!({
                "short": "ok",
                "long": "",
                "nested": {"deep": ["", "ok", {"again": ""}]},
                "n": 12345678901_i64,
                "flag": true,
                "none": null
            })
        );
    }

    #[test]
    fn limit_is_inclusive_and_counts_chars() {
        let mut value = json!({"exact": "héllo", "over": "héllo!"});
        redact(&mut value, 5);
        assert_eq!(value, json!({"exact": "héllo", "over": ""}));
    }

    #[test]
    fn top_level_string_is_redacted() {
        let mut value = json!("abcdef");
        redact(&mut value, 3);
        assert_eq!(value, json!(""));
    }

    #[rstest]
    #[case(json!({"a": "xxxxxxxx", "b": ["yy", "zzzzzzzzz"]}), 4)]
    #[case(json!([{"k": "v"}, "long-long-long"]), 0)]
    #[case(json!(42), 1)]
    fn redaction_is_idempotent(#[case] value: Value, #[case] limit: usize) {
        let once = redacted(&value, limit);
        let twice = redacted(&once, limit);
        assert_eq!(once, twice);
    }
}
