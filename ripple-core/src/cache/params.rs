//! Canonical parameter keys.
//!
//! Two parameter values that differ only in object key order must map to the
//! same cache entry, so keys are built from JSON with every object's keys
//! sorted.

use serde::Serialize;
use serde_json::Value as Json;

use crate::error::ReactiveError;

/// Serialize `params` and build its canonical key.
pub fn params_key<P: Serialize>(resource: &str, params: &P) -> Result<(Json, String), ReactiveError> {
    let json = serde_json::to_value(params).map_err(|err| ReactiveError::InvalidParams {
        resource: resource.to_string(),
        message: err.to_string(),
    })?;
    let key = canonical_json(&json);
    Ok((json, key))
}

/// Deterministic JSON text for `json`, with object keys sorted.
pub fn canonical_json(json: &Json) -> String {
    let mut out = String::new();
    write_canonical(json, &mut out);
    out
}

fn write_canonical(json: &Json, out: &mut String) {
    match json {
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Json::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn key_order_does_not_matter() {
        let a = canonical_json(&json!({ "b": 1, "a": { "y": 2, "x": [1, { "q": 0, "p": 1 }] } }));
        let b = canonical_json(&json!({ "a": { "x": [1, { "p": 1, "q": 0 }], "y": 2 }, "b": 1 }));
        assert_eq!(a, b);
        assert_eq!(a, r#"{"a":{"x":[1,{"p":1,"q":0}],"y":2},"b":1}"#);
    }

    #[test]
    fn array_order_matters() {
        assert_ne!(canonical_json(&json!([1, 2])), canonical_json(&json!([2, 1])));
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(canonical_json(&json!({ "k\"": "a\nb" })), r#"{"k\"":"a\nb"}"#);
    }

    #[test]
    fn typed_params_serialize() {
        #[derive(Serialize)]
        struct Query {
            page: u32,
            search: String,
        }
        let (json, key) = params_key(
            "q",
            &Query {
                page: 2,
                search: "ripple".into(),
            },
        )
        .unwrap();
        assert_eq!(json, json!({ "page": 2, "search": "ripple" }));
        assert_eq!(key, r#"{"page":2,"search":"ripple"}"#);
    }

    #[test]
    fn non_string_map_keys_are_rejected() {
        let mut params = HashMap::new();
        params.insert(vec![1u8], 1);
        let err = params_key("q", &params).unwrap_err();
        assert!(matches!(err, ReactiveError::InvalidParams { resource, .. } if resource == "q"));
    }
}
