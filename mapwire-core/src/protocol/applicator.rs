use std::sync::Mutex;

use tracing::debug;

use super::evaluator::{evaluate, Importer};
use super::expression::Expression;
use super::hooks::{payload_to_hook, resolve_value, Hook};
use super::ids::{ExportId, ImportId};
use super::payload::{Payload, Value};
use crate::error::RpcError;

/// Replays a recorded instruction list against concrete input. Variable 0
/// is the input; each instruction's result occupies the next slot; the
/// final instruction's value is the map's result.
pub struct MapApplicator {
    captures: Vec<Hook>,
    variables: Mutex<Vec<Hook>>,
}

/// Apply a recording to an input payload. Arrays are mapped per element and
/// reassembled; null and undefined pass through untouched; a pending input
/// is refused. The captures are disposed exactly once when the call
/// completes, regardless of outcome.
pub async fn apply_map(
    input: Payload,
    captures: Vec<Hook>,
    instructions: &[Expression],
) -> Result<Payload, RpcError> {
    let applicator = MapApplicator {
        captures,
        variables: Mutex::new(Vec::new()),
    };
    let result = applicator.run(input, instructions).await;
    for hook in applicator.captures {
        hook.dispose();
    }
    result
}

impl MapApplicator {
    async fn run(
        &self,
        input: Payload,
        instructions: &[Expression],
    ) -> Result<Payload, RpcError> {
        if instructions.is_empty() {
            input.dispose();
            return Err(RpcError::protocol("empty instruction list"));
        }
        match input.value() {
            Value::Promise(_) => {
                input.dispose();
                Err(RpcError::map_misuse("cannot map over an unresolved value"))
            }
            Value::Null | Value::Undefined => Ok(input),
            Value::Array(_) => {
                let Value::Array(items) = input.into_value() else {
                    return Err(RpcError::internal("array vanished"));
                };
                debug!(elements = items.len(), "replaying map per element");
                let mut results = Vec::with_capacity(items.len());
                let mut iter = items.into_iter();
                for item in iter.by_ref() {
                    match self.apply_one(Payload::new(item), instructions).await {
                        Ok(payload) => results.push(payload.into_value()),
                        Err(err) => {
                            for rest in iter {
                                rest.dispose();
                            }
                            for produced in results {
                                produced.dispose();
                            }
                            return Err(err);
                        }
                    }
                }
                Ok(Payload::new(Value::Array(results)))
            }
            _ => self.apply_one(input, instructions).await,
        }
    }

    /// One replay pass: seed the variables with the input, run every
    /// instruction, resolve the final value. Intermediates are disposed
    /// only after the result settles, since pipelined results may still
    /// depend on them.
    async fn apply_one(
        &self,
        input: Payload,
        instructions: &[Expression],
    ) -> Result<Payload, RpcError> {
        {
            let mut variables = self
                .variables
                .lock()
                .map_err(|_| RpcError::internal("replay state poisoned"))?;
            variables.push(payload_to_hook(input));
        }
        let result = self.apply_instructions(instructions).await;
        let variables = {
            let mut guard = self
                .variables
                .lock()
                .map_err(|_| RpcError::internal("replay state poisoned"))?;
            std::mem::take(&mut *guard)
        };
        for hook in variables {
            hook.dispose();
        }
        result
    }

    async fn apply_instructions(
        &self,
        instructions: &[Expression],
    ) -> Result<Payload, RpcError> {
        let (last, steps) = instructions
            .split_last()
            .ok_or_else(|| RpcError::protocol("empty instruction list"))?;

        for (index, instruction) in steps.iter().enumerate() {
            debug!(index, "replaying instruction");
            let payload = evaluate(instruction.clone(), self)?;
            let hook = payload_to_hook(payload);
            let mut variables = self
                .variables
                .lock()
                .map_err(|_| RpcError::internal("replay state poisoned"))?;
            variables.push(hook);
        }

        let final_payload = evaluate(last.clone(), self)?;
        let resolved = resolve_value(final_payload.into_value()).await?;
        Ok(Payload::new(resolved))
    }
}

impl Importer for MapApplicator {
    fn import_stub(&self, id: ImportId) -> Result<Hook, RpcError> {
        Err(RpcError::protocol(format!(
            "a recorded callback cannot reference its own exports ({})",
            id
        )))
    }

    fn import_promise(&self, id: ImportId) -> Result<Hook, RpcError> {
        Err(RpcError::protocol(format!(
            "a recorded callback cannot reference its own exports ({})",
            id
        )))
    }

    /// Positive indices are replay variables, negative indices address the
    /// capture list.
    fn lookup_export(&self, id: ExportId) -> Result<Hook, RpcError> {
        let raw = id.0;
        if raw >= 0 {
            let variables = self
                .variables
                .lock()
                .map_err(|_| RpcError::internal("replay state poisoned"))?;
            variables
                .get(raw as usize)
                .map(Hook::dup)
                .ok_or_else(|| RpcError::protocol(format!("unknown replay variable {}", raw)))
        } else {
            let index = (-raw - 1) as usize;
            self.captures
                .get(index)
                .map(Hook::dup)
                .ok_or_else(|| RpcError::protocol(format!("unknown capture {}", raw)))
        }
    }
}

impl std::fmt::Debug for MapApplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapApplicator")
            .field("captures", &self.captures.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::expression::PropertyKey;
    use crate::{RpcError, RpcTarget};
    use async_trait::async_trait;
    use serde_json::Number;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Arith;

    #[async_trait]
    impl RpcTarget for Arith {
        async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
            match method {
                "add1" => match args.first() {
                    Some(Value::Number(n)) => {
                        let sum = n.as_i64().ok_or_else(|| RpcError::target("not an int"))? + 1;
                        Ok(Value::from(sum))
                    }
                    _ => Err(RpcError::target("add1 expects a number")),
                },
                "sum" => {
                    let mut total = 0;
                    for arg in args {
                        if let Value::Number(n) = &arg {
                            total += n.as_i64().unwrap_or(0);
                        }
                        arg.dispose();
                    }
                    Ok(Value::from(total))
                }
                _ => Err(RpcError::target(format!("no such method: {}", method))),
            }
        }

        async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
            Err(RpcError::path(format!("no such property: {}", property)))
        }
    }

    fn pipeline(subject: i64, path: &[&str], args: Option<Vec<Expression>>) -> Expression {
        Expression::Pipeline {
            subject,
            path: path.iter().map(|p| PropertyKey::from(*p)).collect(),
            args: args.map(|a| Box::new(Expression::Array(a))),
        }
    }

    fn variable(index: i64) -> Expression {
        pipeline(index, &[], None)
    }

    fn numbers(ns: &[i64]) -> Payload {
        Payload::new(Value::Array(ns.iter().map(|n| Value::from(*n)).collect()))
    }

    /// Recording of `|x| adder.add1(x)`.
    fn add1_instructions() -> Vec<Expression> {
        vec![
            pipeline(-1, &["add1"], Some(vec![variable(0)])),
            variable(1),
        ]
    }

    #[tokio::test]
    async fn test_apply_per_element() {
        let captures = vec![Hook::for_target(Arc::new(Arith))];
        let result = apply_map(numbers(&[1, 2, 3]), captures, &add1_instructions())
            .await
            .unwrap();
        assert_eq!(
            result.into_value(),
            Value::Array(vec![Value::from(2i64), Value::from(3i64), Value::from(4i64)])
        );
    }

    #[tokio::test]
    async fn test_apply_single_value() {
        let captures = vec![Hook::for_target(Arc::new(Arith))];
        let result = apply_map(
            Payload::new(Value::from(10i64)),
            captures,
            &add1_instructions(),
        )
        .await
        .unwrap();
        assert_eq!(result.into_value(), Value::from(11i64));
    }

    #[tokio::test]
    async fn test_null_and_undefined_pass_through() {
        let result = apply_map(Payload::null(), vec![], &add1_instructions())
            .await
            .unwrap();
        assert_eq!(result.into_value(), Value::Null);

        let result = apply_map(
            Payload::new(Value::Undefined),
            vec![],
            &add1_instructions(),
        )
        .await
        .unwrap();
        assert_eq!(result.into_value(), Value::Undefined);
    }

    #[tokio::test]
    async fn test_pending_input_is_refused() {
        let pending = Value::Promise(Hook::broken(
            crate::protocol::payload::ErrorValue::generic("never"),
        ));
        let err = apply_map(Payload::new(pending), vec![], &add1_instructions())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MapMisuse);
    }

    #[tokio::test]
    async fn test_identity_recording() {
        let result = apply_map(numbers(&[4, 5]), vec![], &[variable(0)])
            .await
            .unwrap();
        assert_eq!(
            result.into_value(),
            Value::Array(vec![Value::from(4i64), Value::from(5i64)])
        );
    }

    #[tokio::test]
    async fn test_property_access_recording() {
        // Recording of `|x| x.value`
        let instructions = vec![pipeline(0, &["value"], None), variable(1)];
        let mut obj = indexmap::IndexMap::new();
        obj.insert("value".to_string(), Value::from(9i64));
        let input = Payload::new(Value::Array(vec![Value::Object(obj)]));
        let result = apply_map(input, vec![], &instructions).await.unwrap();
        assert_eq!(result.into_value(), Value::Array(vec![Value::from(9i64)]));
    }

    #[tokio::test]
    async fn test_chained_instructions() {
        // Recording of `|x| adder.add1(adder.add1(x))`
        let instructions = vec![
            pipeline(-1, &["add1"], Some(vec![variable(0)])),
            pipeline(-1, &["add1"], Some(vec![variable(1)])),
            variable(2),
        ];
        let captures = vec![Hook::for_target(Arc::new(Arith))];
        let result = apply_map(numbers(&[10]), captures, &instructions)
            .await
            .unwrap();
        assert_eq!(result.into_value(), Value::Array(vec![Value::from(12i64)]));
    }

    #[tokio::test]
    async fn test_element_error_propagates() {
        let captures = vec![Hook::for_target(Arc::new(Arith))];
        let input = Payload::new(Value::Array(vec![Value::from(1i64), Value::from("two")]));
        let err = apply_map(input, captures, &add1_instructions())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Target);
    }

    #[tokio::test]
    async fn test_own_exports_are_refused() {
        let instructions = vec![Expression::Export(-1), variable(1)];
        let err = apply_map(numbers(&[1]), vec![], &instructions)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Protocol);
    }
}
