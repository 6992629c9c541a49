//! Cache-key canonicalization.
//!
//! A cache key is the endpoint name plus a canonical JSON rendering of the
//! query arg: object keys sorted recursively, arrays in order. `serde_json`
//! rejects NaN and Infinity at the type level, and absent optional fields
//! are simply omitted, so fingerprints are stable across runs. Identical
//! keys coalesce onto one cache entry.

use serde_json::Value;

/// Canonicalize a JSON value: objects re-emitted with sorted keys.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// The cache key for an endpoint invocation: `"{endpoint}({canonical arg})"`.
pub fn cache_key(endpoint: &str, arg: &Value) -> String {
    format!("{endpoint}({})", canonical_json(arg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_keys_are_sorted_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
        let b = json!({"a": {"m": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"m":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(canonical_json(&json!([1, 2])), canonical_json(&json!([2, 1])));
    }

    #[test]
    fn identical_args_coalesce_to_one_key() {
        assert_eq!(
            cache_key("getUser", &json!({"id": 1, "expand": true})),
            cache_key("getUser", &json!({"expand": true, "id": 1})),
        );
        assert_eq!(cache_key("getUser", &json!({"id": 1})), r#"getUser({"id":1})"#);
    }

    #[test]
    fn scalars_render_plainly() {
        assert_eq!(cache_key("getPosts", &Value::Null), "getPosts(null)");
        assert_eq!(cache_key("getPost", &json!(7)), "getPost(7)");
    }
}
