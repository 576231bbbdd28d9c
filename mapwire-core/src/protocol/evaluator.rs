use indexmap::IndexMap;

use super::expression::{is_forbidden_key, CaptureRef, Expression};
use super::hooks::Hook;
use super::ids::{ExportId, ImportId};
use super::payload::{ErrorValue, Payload, Value};
use crate::error::RpcError;

/// Turns wire references back into live hooks. The session is the default
/// implementer; the map applicator substitutes variables and captures.
pub trait Importer: Send + Sync {
    /// A capability the peer introduced with `["export", id]`.
    fn import_stub(&self, id: ImportId) -> Result<Hook, RpcError>;

    /// An eventual value the peer introduced.
    fn import_promise(&self, id: ImportId) -> Result<Hook, RpcError>;

    /// A reference back to something this side already hosts: an export
    /// entry, or a replay variable/capture.
    fn lookup_export(&self, id: ExportId) -> Result<Hook, RpcError>;
}

/// Decode an instruction tree into a payload, turning references into
/// hooks via the importer.
pub fn evaluate(expr: Expression, importer: &dyn Importer) -> Result<Payload, RpcError> {
    Ok(Payload::new(evaluate_value(expr, importer)?))
}

pub(crate) fn evaluate_value(expr: Expression, importer: &dyn Importer) -> Result<Value, RpcError> {
    match expr {
        Expression::Null => Ok(Value::Null),
        Expression::Undefined => Ok(Value::Undefined),
        Expression::Bool(b) => Ok(Value::Bool(b)),
        Expression::Number(n) => Ok(Value::Number(n)),
        Expression::String(s) => Ok(Value::String(s)),
        Expression::Inf => Ok(Value::Float(f64::INFINITY)),
        Expression::NegInf => Ok(Value::Float(f64::NEG_INFINITY)),
        Expression::Nan => Ok(Value::Float(f64::NAN)),
        Expression::BigInt(digits) => Ok(Value::BigInt(digits)),
        Expression::Date(millis) => Ok(Value::Date(millis)),
        Expression::Bytes(raw) => Ok(Value::Bytes(raw)),
        Expression::Error(err) => {
            let mut error = ErrorValue::new(err.kind, err.message);
            error.stack = err.stack;
            Ok(Value::Error(error))
        }

        Expression::Array(elements) | Expression::EscapedArray(elements) => {
            let mut values = Vec::with_capacity(elements.len());
            for elem in elements {
                match evaluate_value(elem, importer) {
                    Ok(v) => values.push(v),
                    Err(err) => {
                        for v in values {
                            v.dispose();
                        }
                        return Err(err);
                    }
                }
            }
            Ok(Value::Array(values))
        }

        Expression::Object(map) => {
            let mut values: IndexMap<String, Value> = IndexMap::with_capacity(map.len());
            for (key, val) in map {
                if is_forbidden_key(&key) {
                    // Still evaluated so contained hooks are imported and
                    // released exactly once; the key never materializes.
                    match evaluate_value(val, importer) {
                        Ok(v) => v.dispose(),
                        Err(err) => {
                            for (_, v) in values {
                                v.dispose();
                            }
                            return Err(err);
                        }
                    }
                    continue;
                }
                match evaluate_value(val, importer) {
                    Ok(v) => {
                        values.insert(key, v);
                    }
                    Err(err) => {
                        for (_, v) in values {
                            v.dispose();
                        }
                        return Err(err);
                    }
                }
            }
            Ok(Value::Object(values))
        }

        Expression::Export(id) => {
            let hook = importer.import_stub(ImportId(id))?;
            Ok(Value::Stub(hook))
        }

        Expression::Import(id) => {
            let hook = importer.lookup_export(ExportId(id))?;
            Ok(Value::Stub(hook))
        }

        Expression::Pipeline {
            subject,
            path,
            args,
        } => {
            let subject_hook = importer.lookup_export(ExportId(subject))?;
            let result = match args {
                None => subject_hook.get(&path),
                Some(args_expr) => match evaluate_value(*args_expr, importer) {
                    Ok(Value::Array(arg_values)) => subject_hook.call(&path, arg_values),
                    Ok(other) => {
                        other.dispose();
                        Err(RpcError::protocol("pipeline arguments must be an array"))
                    }
                    Err(err) => Err(err),
                },
            };
            subject_hook.dispose();
            Ok(Value::Promise(result?))
        }

        Expression::Remap {
            subject,
            path,
            captures,
            instructions,
        } => {
            let subject_hook = importer.lookup_export(ExportId(subject))?;
            let mut capture_hooks = Vec::with_capacity(captures.len());
            for capture in captures {
                let resolved = match capture {
                    CaptureRef::Import(id) => importer.lookup_export(ExportId(id)),
                    CaptureRef::Export(id) => importer.import_stub(ImportId(id)),
                };
                match resolved {
                    Ok(hook) => capture_hooks.push(hook),
                    Err(err) => {
                        for hook in capture_hooks {
                            hook.dispose();
                        }
                        subject_hook.dispose();
                        return Err(err);
                    }
                }
            }
            let result = subject_hook.map_recorded(&path, capture_hooks, instructions);
            subject_hook.dispose();
            Ok(Value::Promise(result?))
        }
    }
}

/// An importer for hook-free data: any reference is an error. Useful when
/// decoding plain values outside a session.
#[derive(Debug, Default)]
pub struct PlainImporter;

impl Importer for PlainImporter {
    fn import_stub(&self, id: ImportId) -> Result<Hook, RpcError> {
        Err(RpcError::internal(format!("cannot import {} here", id)))
    }

    fn import_promise(&self, id: ImportId) -> Result<Hook, RpcError> {
        Err(RpcError::internal(format!("cannot import {} here", id)))
    }

    fn lookup_export(&self, id: ExportId) -> Result<Hook, RpcError> {
        Err(RpcError::internal(format!("unknown reference {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::devaluator::{devaluate, PlainExporter};
    use bytes::Bytes;
    use serde_json::json;

    fn roundtrip(value: Value) -> Value {
        let expr = devaluate(Payload::new(value), &PlainExporter).unwrap();
        let wire = expr.to_json();
        let parsed = Expression::from_json(&wire).unwrap();
        evaluate(parsed, &PlainImporter).unwrap().into_value()
    }

    #[test]
    fn test_scalar_roundtrip() {
        assert_eq!(roundtrip(Value::Null), Value::Null);
        assert_eq!(roundtrip(Value::Undefined), Value::Undefined);
        assert_eq!(roundtrip(Value::from(42i64)), Value::from(42i64));
        assert_eq!(roundtrip(Value::from(2.5f64)), Value::from(2.5f64));
        assert_eq!(roundtrip(Value::Float(f64::INFINITY)), Value::Float(f64::INFINITY));
        assert_eq!(roundtrip(Value::Float(f64::NAN)), Value::Float(f64::NAN));
        assert_eq!(
            roundtrip(Value::BigInt("-170141183460469231731687303715884105728".into())),
            Value::BigInt("-170141183460469231731687303715884105728".into())
        );
        assert_eq!(
            roundtrip(Value::Bytes(Bytes::from_static(b"\x00\x01\xff"))),
            Value::Bytes(Bytes::from_static(b"\x00\x01\xff"))
        );
        assert_eq!(roundtrip(Value::Date(1700000000000.0)), Value::Date(1700000000000.0));
    }

    #[test]
    fn test_nested_structure_roundtrip() {
        let mut obj = IndexMap::new();
        obj.insert(
            "list".to_string(),
            Value::Array(vec![
                Value::from(1i64),
                Value::Array(vec![Value::from("date")]),
                Value::Null,
            ]),
        );
        obj.insert(
            "err".to_string(),
            Value::Error(ErrorValue::new(crate::error::ErrorKind::Range, "too big")),
        );
        let value = Value::Object(obj);
        let copy = value.deep_copy();
        assert_eq!(roundtrip(value), copy);
    }

    #[test]
    fn test_forbidden_keys_dropped_on_evaluate() {
        let wire = json!({"__proto__": {"x": 1}, "y": 2, "toJSON": 3});
        let expr = Expression::from_json(&wire).unwrap();
        let value = evaluate(expr, &PlainImporter).unwrap().into_value();
        match value {
            Value::Object(map) => {
                assert_eq!(map.len(), 1);
                assert_eq!(map.get("y"), Some(&Value::from(2i64)));
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_importer_refuses_references() {
        let expr = Expression::from_json(&json!(["export", -1])).unwrap();
        assert!(evaluate(expr, &PlainImporter).is_err());
        let expr = Expression::from_json(&json!(["pipeline", 0, ["x"]])).unwrap();
        assert!(evaluate(expr, &PlainImporter).is_err());
    }
}
