//! Changed-keys-only structural diff.
//!
//! The delta is additive: it reports keys whose value changed or appeared in
//! `after`, never keys that disappeared.

use serde_json::{Map, Value};

/// Compute the delta from `before` to `after`.
///
/// For a key present on both sides:
/// - both objects: recurse, keep the key only if the nested delta is non-empty;
/// - one object and one non-object: take the whole `after` value;
/// - otherwise (scalars, arrays): take the whole `after` value when unequal.
///
/// A non-object `before` behaves like `{}`. A non-object `after` has no keys,
/// so its delta is empty.
#[must_use]
pub fn diff(before: &Value, after: &Value) -> Map<String, Value> {
    let Value::Object(after) = after else {
        return Map::new();
    };
    let empty = Map::new();
    let before = match before {
        Value::Object(map) => map,
        _ => &empty,
    };
    diff_maps(before, after)
}

fn diff_maps(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    let mut delta = Map::new();
    for (key, new) in after {
        match (before.get(key), new) {
            (Some(old), _) if old == new => {},
            (Some(Value::Object(old)), Value::Object(new_map)) => {
                let nested = diff_maps(old, new_map);
                if !nested.is_empty() {
                    delta.insert(key.clone(), Value::Object(nested));
                }
            },
            _ => {
                delta.insert(key.clone(), new.clone());
            },
        }
    }
    delta
}

/// Apply a delta produced by [`diff`] on top of `base`.
///
/// Nested objects in the delta are merged key by key into matching objects of
/// `base`; every other value replaces what was there.
pub fn apply(base: &mut Value, delta: &Map<String, Value>) {
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    let Value::Object(target) = base else {
        return;
    };
    for (key, change) in delta {
        if let Value::Object(nested) = change
            && let Some(existing) = target.get_mut(key)
            && existing.is_object()
        {
            apply(existing, nested);
            continue;
        }
        target.insert(key.clone(), change.clone());
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {rstest::rstest, serde_json::json};

    use super::*;

    #[rstest]
    #[case(json!({}))]
    #[case(json!({"a": 1, "b": [1, 2], "c": {"d": {"e": null}}}))]
    #[case(json!("scalar"))]
    fn identical_values_have_empty_delta(#[case] value: Value) {
        assert!(diff(&value, &value).is_empty());
    }

    #[test]
    fn nested_scalar_change_is_reported_as_nested_delta() {
        let before = json!({"test": 1, "group": {"test2": 1, "test3": {"test4": 1}}});
        let after = json!({"test": 1, "group": {"test2": 1, "test3": {"test4": "abc"}}});
        assert_eq!(
            Value::Object(diff(&before, &after)),
            json!({"group": {"test3": {"test4": "abc"}}})
        );
    }

    #[test]
    fn shape_change_takes_whole_after_value() {
        let before = json!({"a1": "abc", "bkkl": {"dc": 1, "test3": {"test4": 1}}, "akks": "2"});
        let after = json!({
            "a1": "abc",
            "bkkl": {"dc": {"k9js": {"tk5m": 1}}, "test3": {"test4": 1}},
            "akks": "5"
        });
        assert_eq!(
            Value::Object(diff(&before, &after)),
            json!({"bkkl": {"dc": {"k9js": {"tk5m": 1}}}, "akks": "5"})
        );
    }

    #[test]
    fn object_replaced_by_scalar_takes_scalar() {
        let before = json!({"meta": {"x": 1}});
        let after = json!({"meta": 7});
        assert_eq!(Value::Object(diff(&before, &after)), json!({"meta": 7}));
    }

    #[test]
    fn removed_keys_are_not_reported() {
        let before = json!({"keep": 1, "gone": 2, "nested": {"gone": true, "x": 1}});
        let after = json!({"keep": 1, "nested": {"x": 1}});
        assert!(diff(&before, &after).is_empty());
    }

    #[test]
    fn added_keys_are_reported() {
        let before = json!({"a": 1});
        let after = json!({"a": 1, "b": {"c": 2}});
        assert_eq!(Value::Object(diff(&before, &after)), json!({"b": {"c": 2}}));
    }

    #[test]
    fn arrays_are_leaves() {
        let before = json!({"tags": [1, 2, 3]});
        let after = json!({"tags": [1, 2, 4]});
        assert_eq!(Value::Object(diff(&before, &after)), json!({"tags": [1, 2, 4]}));
    }

    #[test]
    fn non_object_roots() {
        assert_eq!(
            Value::Object(diff(&Value::Null, &json!({"a": 1}))),
            json!({"a": 1})
        );
        assert!(diff(&json!({"a": 1}), &json!([1])).is_empty());
    }

    #[rstest]
    #[case(json!({"a": 1}), json!({"a": 2, "b": {"c": {"d": 1}}}))]
    #[case(json!({"a": {"b": 1, "c": 2}}), json!({"a": {"b": 1, "c": 3}}))]
    #[case(json!({"a": {"b": 1}}), json!({"a": "flat"}))]
    #[case(json!({"a": "flat"}), json!({"a": {"b": [1, {"c": 2}]}}))]
    fn apply_reproduces_after_keys(#[case] before: Value, #[case] after: Value) {
        let delta = diff(&before, &after);
        let mut patched = before.clone();
        apply(&mut patched, &delta);
        for (key, value) in after.as_object().unwrap() {
            assert_eq!(patched.get(key), Some(value), "key {key}");
        }
    }
}
