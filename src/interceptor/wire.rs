//! Wire-format decoder for tool-call arguments (spec.md §4.3.1, §9).
//!
//! The upstream encodes values with a variable-length tag scheme on a
//! positionally-interpreted JSON array. Values arrive wrapped in one or
//! more levels of single-element lists; decoding must unwrap until it
//! either recognizes a tag-length shape or spots a "parameter list" — a
//! list whose first element is itself a `[string, value]` pair. The
//! parameter-list check takes priority over tag-length interpretation:
//! skipping that ordering silently re-wraps objects inside arrays as
//! `{"x":["value"]}` instead of `{"x":"value"}` (the bug the source's v2
//! parser exists to fix).

use serde_json::{Map, Value};

const MAX_UNWRAP_DEPTH: usize = 10;

/// Looks like a parameter list: non-empty list whose first element is a
/// `[string, value, ...]` pair.
fn looks_like_param_list(v: &Value) -> bool {
    let Value::Array(items) = v else { return false };
    let Some(Value::Array(first)) = items.first() else {
        return false;
    };
    first.len() >= 2 && matches!(first.first(), Some(Value::String(_)))
}

/// Unwraps nested single-element lists until a parameter list is found.
fn unwrap_to_param_list(args: &Value) -> Option<Vec<Value>> {
    let mut current = args.clone();
    for _ in 0..MAX_UNWRAP_DEPTH {
        let Value::Array(items) = &current else {
            return None;
        };
        if items.is_empty() {
            return None;
        }
        if looks_like_param_list(&current) {
            return Some(items.clone());
        }
        match &items[0] {
            Value::Array(_) => {
                current = items[0].clone();
            }
            _ => return None,
        }
    }
    None
}

/// Parses a wire-format parameter list into a flat JSON object, recursing
/// into nested objects/arrays per the tag-length scheme.
pub fn parse_toolcall_params(args: &Value) -> Value {
    let Some(params) = unwrap_to_param_list(args) else {
        return Value::Object(Map::new());
    };
    let mut out = Map::new();
    for param in params {
        let Value::Array(pair) = &param else { continue };
        if pair.len() < 2 {
            continue;
        }
        let Value::String(name) = &pair[0] else { continue };
        out.insert(name.clone(), decode_tagged_value(&pair[1]));
    }
    Value::Object(out)
}

/// Decodes one tag-length-encoded scalar/structural value.
///
/// - len==1 -> null
/// - len==2 -> number: v[1]
/// - len==3 -> string: v[2]
/// - len==4 -> boolean: v[3] == 1
/// - len==5 -> object: recurse on v[4] as param list
/// - len==6 -> array: decode each element of v[5]
fn decode_tagged_value(v: &Value) -> Value {
    let Value::Array(items) = v else {
        return v.clone();
    };
    match items.len() {
        1 => Value::Null,
        2 => items[1].clone(),
        3 => items[2].clone(),
        4 => Value::Bool(items[3] == Value::Number(1.into())),
        5 => parse_toolcall_params(&items[4]),
        6 => match &items[5] {
            Value::Array(elements) => {
                Value::Array(elements.iter().map(decode_array_item).collect())
            }
            _ => Value::Array(vec![]),
        },
        _ => v.clone(),
    }
}

/// Decodes a single array element, which may itself be wrapped or be a
/// nested parameter list (object). The param-list check runs first.
fn decode_array_item(item: &Value) -> Value {
    let Value::Array(items) = item else {
        return item.clone();
    };
    if items.is_empty() {
        return Value::Null;
    }
    if looks_like_param_list(item) {
        return parse_toolcall_params(&Value::Array(vec![item.clone()]));
    }
    match items.len() {
        1 => match &items[0] {
            Value::Array(_) => decode_array_item(&items[0]),
            _ => Value::Null,
        },
        2 => {
            if items[0].is_null() && !items[1].is_null() {
                items[1].clone()
            } else if let Value::Array(_) = &items[0] {
                decode_array_item(&items[0])
            } else {
                items[1].clone()
            }
        }
        3 => {
            if items[0].is_null() && items[1].is_null() {
                items[2].clone()
            } else if let Value::Array(_) = &items[0] {
                decode_array_item(&items[0])
            } else {
                items[2].clone()
            }
        }
        4 => {
            if items[0].is_null() && items[1].is_null() && items[2].is_null() {
                Value::Bool(items[3] == Value::Number(1.into()))
            } else if let Value::Array(_) = &items[0] {
                decode_array_item(&items[0])
            } else {
                Value::Bool(items[3] == Value::Number(1.into()))
            }
        }
        5 => {
            if !items[4].is_null() {
                parse_toolcall_params(&items[4])
            } else {
                Value::Object(Map::new())
            }
        }
        6 => match &items[5] {
            Value::Array(nested) => Value::Array(nested.iter().map(decode_array_item).collect()),
            _ => Value::Array(vec![]),
        },
        _ => {
            if let Value::Array(_) = &items[0] {
                decode_array_item(&items[0])
            } else {
                item.clone()
            }
        }
    }
}

/// Deep-stable canonical JSON for dedup keying: object keys sorted
/// recursively. `serde_json`'s default map is a `BTreeMap` so
/// `to_string` is already key-sorted at every level; this exists mainly
/// to document the invariant (spec.md §9: "the sort must be deep/stable").
pub fn canonical_json(v: &Value) -> String {
    v.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_flat_params() {
        // args wrapped one level: [[["q", [null, null, "hi"]]]]
        let args = json!([[["q", [null, null, "hi"]]]]);
        let parsed = parse_toolcall_params(&args);
        assert_eq!(parsed, json!({"q": "hi"}));
    }

    #[test]
    fn decodes_number_and_boolean() {
        let args = json!([[
            ["n", [null, 42]],
            ["b", [null, null, null, 1]],
        ]]);
        let parsed = parse_toolcall_params(&args);
        assert_eq!(parsed["n"], json!(42));
        assert_eq!(parsed["b"], json!(true));
    }

    #[test]
    fn decodes_nested_object() {
        let args = json!([[
            ["inner", [null, null, null, null, [["x", [null, 1]]]]],
        ]]);
        let parsed = parse_toolcall_params(&args);
        assert_eq!(parsed["inner"], json!({"x": 1}));
    }

    #[test]
    fn decodes_array_of_objects_not_rewrapped() {
        // Regression test for the v2-parser bug: an array whose items are
        // themselves param-lists must decode to objects, not {"x": ["value"]}.
        let item_obj = json!([["x", [null, null, "value"]]]);
        let args = json!([[
            ["arr", [null, null, null, null, null, [item_obj]]],
        ]]);
        let parsed = parse_toolcall_params(&args);
        assert_eq!(parsed["arr"], json!([{"x": "value"}]));
    }

    #[test]
    fn decodes_plain_array_of_strings() {
        let args = json!([[
            ["tags", [null, null, null, null, null, [
                [null, null, "a"],
                [null, null, "b"],
            ]]],
        ]]);
        let parsed = parse_toolcall_params(&args);
        assert_eq!(parsed["tags"], json!(["a", "b"]));
    }

    #[test]
    fn missing_param_list_yields_empty_object() {
        let parsed = parse_toolcall_params(&json!([null]));
        assert_eq!(parsed, json!({}));
    }
}
