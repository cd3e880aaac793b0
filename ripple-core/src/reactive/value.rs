//! Dynamic values held by observables.
//!
//! A [`Value`] is either a primitive or a nested [`Observable`]. Nested
//! observables give deep reactivity: reading a field that holds a record or a
//! list hands back a store that tracks its own fields.
//!
//! # Equality policy
//!
//! Writes are skipped when the new value is the [same](Value::same) as the
//! old one. Stores compare by identity, primitives by value.

use std::rc::Rc;

use serde_json::{Map, Number};

use super::observable::Observable;

/// A value stored in an observable field.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(Rc<str>),
    Store(Observable),
}

impl Value {
    /// Identity for stores, value equality for primitives.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Store(a), Value::Store(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Convert JSON into a value, creating observables for objects and arrays.
    ///
    /// `name` is used for debugging; nested stores are named `name.key`.
    pub fn from_json(name: &str, json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.as_str().into()),
            serde_json::Value::Array(items) => Value::Store(Observable::list_from_json(name, items)),
            serde_json::Value::Object(map) => Value::Store(Observable::record_from_json(name, map)),
        }
    }

    /// Snapshot as JSON. Does not track.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Store(store) => store.to_json(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_store(&self) -> Option<&Observable> {
        match self {
            Value::Store(store) => Some(store),
            _ => None,
        }
    }

    /// Short structural name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Store(store) if store.is_list() => "array",
            Value::Store(_) => "object",
        }
    }
}

/// Structural name of a JSON value, matching [`Value::kind_name`].
pub(crate) fn json_kind_name(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number((n as u64).into())
    }
}

impl From<f64> for Value {
    /// Non-finite numbers have no JSON form and become `Null`.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Observable> for Value {
    fn from(store: Observable) -> Self {
        Value::Store(store)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        Value::from_json("value", json)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json("value", &json)
    }
}

impl From<Map<String, serde_json::Value>> for Value {
    fn from(map: Map<String, serde_json::Value>) -> Self {
        Value::Store(Observable::record_from_json("value", &map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_compare_by_value() {
        assert!(Value::from(1).same(&Value::from(1)));
        assert!(Value::from("a").same(&Value::from("a")));
        assert!(!Value::from(1).same(&Value::from(2)));
        assert!(!Value::from(1).same(&Value::from("1")));
        assert!(Value::Null.same(&Value::Null));
    }

    #[test]
    fn stores_compare_by_identity() {
        let a = Value::from(json!({ "id": 1 }));
        let b = Value::from(json!({ "id": 1 }));
        assert!(!a.same(&b));
        assert!(a.same(&a.clone()));
    }

    #[test]
    fn json_conversion_preserves_shape() {
        let source = json!({ "name": "x", "tags": ["a", "b"], "n": 2.5, "ok": true, "none": null });
        let value = Value::from(&source);
        assert_eq!(value.kind_name(), "object");
        assert_eq!(value.to_json(), source);
    }

    #[test]
    fn non_finite_numbers_become_null() {
        assert!(Value::from(f64::NAN).is_null());
        assert_eq!(Value::from(1.5).as_f64(), Some(1.5));
    }
}
