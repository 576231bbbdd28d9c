use indexmap::IndexMap;

use super::expression::{is_forbidden_key, ErrorExpression, Expression};
use super::hooks::Hook;
use super::payload::{Payload, Value};
use crate::error::RpcError;

/// Allocates ids for hooks encountered while devaluating. The session is
/// the default implementer; the map builder substitutes capture indices.
pub trait Exporter: Send + Sync {
    /// Take ownership of a local capability and name it on the wire.
    fn export_stub(&self, hook: Hook) -> Result<Expression, RpcError>;

    /// Take ownership of a local eventual value and name it on the wire.
    fn export_promise(&self, hook: Hook) -> Result<Expression, RpcError>;

    /// Translate a hook the peer already knows (an import, or a pipelined
    /// promise) without allocating. `None` means the hook is local.
    fn translate_import(&self, hook: &Hook) -> Option<Expression>;
}

/// Encode a payload as an instruction tree, transferring hook ownership to
/// the exporter.
pub fn devaluate(payload: Payload, exporter: &dyn Exporter) -> Result<Expression, RpcError> {
    devaluate_value(payload.into_value(), exporter)
}

pub(crate) fn devaluate_value(
    value: Value,
    exporter: &dyn Exporter,
) -> Result<Expression, RpcError> {
    match value {
        Value::Null => Ok(Expression::Null),
        Value::Undefined => Ok(Expression::Undefined),
        Value::Bool(b) => Ok(Expression::Bool(b)),
        Value::Number(n) => Ok(Expression::Number(n)),
        Value::Float(f) => {
            if f.is_nan() {
                Ok(Expression::Nan)
            } else if f.is_sign_positive() {
                Ok(Expression::Inf)
            } else {
                Ok(Expression::NegInf)
            }
        }
        Value::BigInt(digits) => Ok(Expression::BigInt(digits)),
        Value::String(s) => Ok(Expression::String(s)),
        Value::Bytes(raw) => Ok(Expression::Bytes(raw)),
        Value::Date(millis) => Ok(Expression::Date(millis)),
        Value::Error(err) => Ok(Expression::Error(ErrorExpression {
            kind: err.kind,
            message: err.message,
            stack: err.stack,
        })),

        Value::Array(items) => {
            let mut encoded = Vec::with_capacity(items.len());
            let mut iter = items.into_iter();
            for item in iter.by_ref() {
                match devaluate_value(item, exporter) {
                    Ok(e) => encoded.push(e),
                    Err(err) => {
                        for rest in iter {
                            rest.dispose();
                        }
                        return Err(err);
                    }
                }
            }
            if Expression::array_needs_escape(&encoded) {
                Ok(Expression::EscapedArray(encoded))
            } else {
                Ok(Expression::Array(encoded))
            }
        }

        Value::Object(map) => {
            let mut encoded = IndexMap::with_capacity(map.len());
            let mut iter = map.into_iter();
            for (key, val) in iter.by_ref() {
                if is_forbidden_key(&key) {
                    // The key is dropped but its hooks are still released.
                    val.dispose();
                    continue;
                }
                match devaluate_value(val, exporter) {
                    Ok(e) => {
                        encoded.insert(key, e);
                    }
                    Err(err) => {
                        for (_, rest) in iter {
                            rest.dispose();
                        }
                        return Err(err);
                    }
                }
            }
            Ok(Expression::Object(encoded))
        }

        Value::Stub(hook) => match exporter.translate_import(&hook) {
            Some(expr) => {
                hook.dispose();
                Ok(expr)
            }
            None => exporter.export_stub(hook),
        },

        Value::Promise(hook) => match exporter.translate_import(&hook) {
            Some(expr) => {
                hook.dispose();
                Ok(expr)
            }
            None => exporter.export_promise(hook),
        },
    }
}

/// An exporter for hook-free data: any capability is an error. Useful when
/// encoding plain values outside a session.
#[derive(Debug, Default)]
pub struct PlainExporter;

impl Exporter for PlainExporter {
    fn export_stub(&self, hook: Hook) -> Result<Expression, RpcError> {
        hook.dispose();
        Err(RpcError::internal("cannot export a capability here"))
    }

    fn export_promise(&self, hook: Hook) -> Result<Expression, RpcError> {
        hook.dispose();
        Err(RpcError::internal("cannot export a promise here"))
    }

    fn translate_import(&self, _hook: &Hook) -> Option<Expression> {
        None
    }
}
