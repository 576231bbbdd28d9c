use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use serde_json::Number;

use super::expression::PropertyKey;
use super::hooks::Hook;
use crate::error::{ErrorKind, RpcError};

/// A host value. The cargo of payloads, call arguments and results.
///
/// `Value` is deliberately not `Clone`: hooks inside a value are owned, and
/// `deep_copy` is the explicit duplication operation.
#[derive(Debug)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    /// A finite JSON number.
    Number(Number),
    /// A non-finite float: infinities and NaN only.
    Float(f64),
    /// An arbitrary-width integer, decimal digits.
    BigInt(String),
    String(String),
    Bytes(Bytes),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Error(ErrorValue),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    /// A capability reference.
    Stub(Hook),
    /// An eventual value.
    Promise(Hook),
}

impl Value {
    pub fn number(n: impl Into<Number>) -> Value {
        Value::Number(n.into())
    }

    /// A float value: finite floats become numbers, the rest stay tagged.
    pub fn float(f: f64) -> Value {
        match Number::from_f64(f) {
            Some(n) => Value::Number(n),
            None => Value::Float(f),
        }
    }

    pub fn date_from(when: DateTime<Utc>) -> Value {
        Value::Date(when.timestamp_millis() as f64)
    }

    /// The date value as a `chrono` timestamp, when it is one.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(millis) => Utc.timestamp_millis_opt(*millis as i64).single(),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Value::Promise(_))
    }

    /// Duplicate this value, duplicating every interior hook.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Null => Value::Null,
            Value::Undefined => Value::Undefined,
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => Value::Number(n.clone()),
            Value::Float(f) => Value::Float(*f),
            Value::BigInt(s) => Value::BigInt(s.clone()),
            Value::String(s) => Value::String(s.clone()),
            Value::Bytes(b) => Value::Bytes(b.clone()),
            Value::Date(d) => Value::Date(*d),
            Value::Error(e) => Value::Error(e.clone()),
            Value::Array(items) => Value::Array(items.iter().map(Value::deep_copy).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ),
            Value::Stub(hook) => Value::Stub(hook.dup()),
            Value::Promise(hook) => Value::Promise(hook.dup()),
        }
    }

    /// Release every hook owned by this value.
    pub fn dispose(self) {
        match self {
            Value::Array(items) => {
                for item in items {
                    item.dispose();
                }
            }
            Value::Object(map) => {
                for (_, v) in map {
                    v.dispose();
                }
            }
            Value::Stub(hook) | Value::Promise(hook) => hook.dispose(),
            _ => {}
        }
    }

    /// Visit every hook inside this value.
    pub fn for_each_hook<'a>(&'a self, f: &mut impl FnMut(&'a Hook)) {
        match self {
            Value::Array(items) => {
                for item in items {
                    item.for_each_hook(f);
                }
            }
            Value::Object(map) => {
                for v in map.values() {
                    v.for_each_hook(f);
                }
            }
            Value::Stub(hook) | Value::Promise(hook) => f(hook),
            _ => {}
        }
    }
}

// Structural equality for data; hooks compare by core identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => {
                (a.is_nan() && b.is_nan()) || a == b
            }
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Stub(a), Value::Stub(b)) => a.identity() == b.identity(),
            (Value::Promise(a), Value::Promise(b)) => a.identity() == b.identity(),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Number(Number::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Value {
        Value::Number(Number::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

/// A value-level error: the decoded form of `["error", kind, msg, stack?]`.
/// `broken` marks dead-capability failures; it never travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
    pub broken: bool,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorValue {
            kind,
            message: message.into(),
            stack: None,
            broken: false,
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }

    pub fn broken(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Generic, message);
        err.broken = true;
        err
    }
}

impl From<RpcError> for ErrorValue {
    fn from(err: RpcError) -> Self {
        if err.code == crate::error::ErrorCode::Broken {
            ErrorValue::broken(err.message)
        } else {
            ErrorValue::generic(err.message)
        }
    }
}

impl From<ErrorValue> for RpcError {
    fn from(err: ErrorValue) -> Self {
        if err.broken {
            RpcError::broken(err.message)
        } else {
            RpcError::target(err.message)
        }
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// An owned value bundle. The payload owns every hook inside its value;
/// disposing the payload disposes them all.
#[derive(Debug, PartialEq)]
pub struct Payload {
    value: Value,
}

impl Payload {
    pub fn new(value: Value) -> Self {
        Payload { value }
    }

    pub fn null() -> Self {
        Payload { value: Value::Null }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Transfer the value out, hooks and all.
    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn deep_copy(&self) -> Payload {
        Payload {
            value: self.value.deep_copy(),
        }
    }

    pub fn dispose(self) {
        self.value.dispose();
    }
}

/// Where a path walk landed.
#[derive(Debug)]
pub enum Navigated<'a> {
    /// A plain value at the end of the path.
    Value(&'a Value),
    /// The walk hit a capability; the remaining path belongs to it.
    Hook(&'a Hook, Vec<PropertyKey>),
}

/// Walk a property path through a value. Stops early when a hook is
/// encountered so the caller can delegate the rest of the path.
pub fn navigate<'a>(value: &'a Value, path: &[PropertyKey]) -> Result<Navigated<'a>, RpcError> {
    let mut current = value;
    for (i, key) in path.iter().enumerate() {
        match current {
            Value::Stub(hook) | Value::Promise(hook) => {
                return Ok(Navigated::Hook(hook, path[i..].to_vec()));
            }
            Value::Object(map) => match key {
                PropertyKey::String(name) => {
                    current = map
                        .get(name)
                        .ok_or_else(|| RpcError::path(format!("no such property: {}", name)))?;
                }
                PropertyKey::Number(n) => {
                    return Err(RpcError::path(format!(
                        "cannot index object with number {}",
                        n
                    )));
                }
            },
            Value::Array(items) => match key {
                PropertyKey::Number(index) => {
                    current = items.get(*index).ok_or_else(|| {
                        RpcError::path(format!("index {} out of bounds", index))
                    })?;
                }
                PropertyKey::String(name) => {
                    return Err(RpcError::path(format!(
                        "cannot access property {} of an array",
                        name
                    )));
                }
            },
            _ => {
                return Err(RpcError::path(format!(
                    "cannot access property {} of a non-container value",
                    key
                )));
            }
        }
    }
    match current {
        Value::Stub(hook) | Value::Promise(hook) => Ok(Navigated::Hook(hook, Vec::new())),
        other => Ok(Navigated::Value(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_object() -> Value {
        let mut user = IndexMap::new();
        user.insert("name".to_string(), Value::from("Alice"));
        user.insert("age".to_string(), Value::from(30i64));
        let mut root = IndexMap::new();
        root.insert("user".to_string(), Value::Object(user));
        root.insert(
            "tags".to_string(),
            Value::Array(vec![Value::from("a"), Value::from("b")]),
        );
        Value::Object(root)
    }

    #[test]
    fn test_navigate_object_path() {
        let value = sample_object();
        let path = vec![PropertyKey::from("user"), PropertyKey::from("name")];
        match navigate(&value, &path).unwrap() {
            Navigated::Value(Value::String(s)) => assert_eq!(s, "Alice"),
            other => panic!("unexpected navigation result: {:?}", other),
        }
    }

    #[test]
    fn test_navigate_array_index() {
        let value = sample_object();
        let path = vec![PropertyKey::from("tags"), PropertyKey::from(1usize)];
        match navigate(&value, &path).unwrap() {
            Navigated::Value(Value::String(s)) => assert_eq!(s, "b"),
            other => panic!("unexpected navigation result: {:?}", other),
        }
    }

    #[test]
    fn test_navigate_missing_property() {
        let value = sample_object();
        let path = vec![PropertyKey::from("nope")];
        let err = navigate(&value, &path).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Path);
    }

    #[test]
    fn test_navigate_wrong_key_kind() {
        let value = sample_object();
        assert!(navigate(&value, &[PropertyKey::from(0usize)]).is_err());
        let path = vec![PropertyKey::from("tags"), PropertyKey::from("x")];
        assert!(navigate(&value, &path).is_err());
    }

    #[test]
    fn test_deep_copy_is_structural() {
        let value = sample_object();
        let copy = value.deep_copy();
        assert_eq!(value, copy);
        copy.dispose();
        value.dispose();
    }

    #[test]
    fn test_float_constructor() {
        assert_eq!(Value::float(1.5), Value::Number(Number::from_f64(1.5).unwrap()));
        assert!(matches!(Value::float(f64::INFINITY), Value::Float(_)));
        assert!(matches!(Value::float(f64::NAN), Value::Float(_)));
    }

    #[test]
    fn test_nan_equality() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(f64::INFINITY), Value::Float(f64::NEG_INFINITY));
    }

    #[test]
    fn test_date_chrono_helpers() {
        let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let value = Value::date_from(when);
        assert_eq!(value.as_datetime(), Some(when));
    }
}
