use base64::Engine;
use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::{Number, Value as JsonValue};

use crate::error::ErrorKind;

/// Object keys and path elements that collide with root-object prototype
/// members (plus `toJSON`). Forbidden in property paths; dropped from
/// decoded objects.
pub const FORBIDDEN_KEYS: &[&str] = &[
    "__proto__",
    "constructor",
    "prototype",
    "hasOwnProperty",
    "isPrototypeOf",
    "propertyIsEnumerable",
    "toLocaleString",
    "toString",
    "valueOf",
    "toJSON",
];

pub fn is_forbidden_key(key: &str) -> bool {
    FORBIDDEN_KEYS.contains(&key)
}

/// Instruction tags recognized by the decoder. A literal array whose first
/// element is one of these must be escaped by the encoder.
const KNOWN_TAGS: &[&str] = &[
    "undefined", "inf", "-inf", "nan", "bigint", "date", "bytes", "error", "import", "export",
    "pipeline", "remap",
];

/// One element of a property path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(String),
    Number(usize),
}

impl PropertyKey {
    pub fn parse_path(value: &JsonValue) -> Result<Vec<PropertyKey>, ExpressionError> {
        let arr = value
            .as_array()
            .ok_or(ExpressionError::InvalidPropertyPath)?;

        arr.iter()
            .map(|v| {
                if let Some(s) = v.as_str() {
                    if is_forbidden_key(s) {
                        return Err(ExpressionError::ForbiddenKey(s.to_string()));
                    }
                    Ok(PropertyKey::String(s.to_string()))
                } else if let Some(n) = v.as_u64() {
                    Ok(PropertyKey::Number(n as usize))
                } else {
                    Err(ExpressionError::InvalidPropertyPath)
                }
            })
            .collect()
    }

    pub fn path_to_json(path: &[PropertyKey]) -> JsonValue {
        let elements: Vec<JsonValue> = path
            .iter()
            .map(|key| match key {
                PropertyKey::String(s) => JsonValue::String(s.clone()),
                PropertyKey::Number(n) => JsonValue::Number(Number::from(*n)),
            })
            .collect();
        JsonValue::Array(elements)
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        PropertyKey::String(s.to_string())
    }
}

impl From<usize> for PropertyKey {
    fn from(n: usize) -> Self {
        PropertyKey::Number(n)
    }
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyKey::String(s) => write!(f, "{}", s),
            PropertyKey::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Wire error form: `["error", kind, message, stack?]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorExpression {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
}

/// A capture reference inside a remap: `["import", id]` or `["export", id]`.
/// Inside a recording, ids double as variable indices (positive) and capture
/// indices (negative).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureRef {
    Import(i64),
    Export(i64),
}

impl CaptureRef {
    fn from_json(value: &JsonValue) -> Result<Self, ExpressionError> {
        let arr = value.as_array().ok_or(ExpressionError::InvalidCapture)?;
        if arr.len() != 2 {
            return Err(ExpressionError::InvalidCapture);
        }
        let tag = arr[0].as_str().ok_or(ExpressionError::InvalidCapture)?;
        let id = arr[1].as_i64().ok_or(ExpressionError::InvalidCapture)?;
        match tag {
            "import" => Ok(CaptureRef::Import(id)),
            "export" => Ok(CaptureRef::Export(id)),
            _ => Err(ExpressionError::InvalidCapture),
        }
    }

    fn to_json(self) -> JsonValue {
        match self {
            CaptureRef::Import(id) => serde_json::json!(["import", id]),
            CaptureRef::Export(id) => serde_json::json!(["export", id]),
        }
    }
}

/// The instruction tree: every value and operation the codec can put on the
/// wire. Literals pass through; everything else is a tagged array.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    // Literal JSON values
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Expression>),
    /// A literal array that had to be wrapped to avoid instruction syntax:
    /// `[[...]]` on the wire.
    EscapedArray(Vec<Expression>),
    Object(IndexMap<String, Expression>),

    // Tagged scalar forms
    Undefined,
    Inf,
    NegInf,
    Nan,
    /// `["bigint", "<decimal>"]`
    BigInt(String),
    /// `["date", millis]`
    Date(f64),
    /// `["bytes", "<base64>"]`
    Bytes(Bytes),
    /// `["error", kind, message, stack?]`
    Error(ErrorExpression),

    // Capability forms
    /// `["import", id]` - the sender passes back a capability the receiver
    /// exported.
    Import(i64),
    /// `["export", id]` - the sender introduces a capability of its own.
    Export(i64),
    /// `["pipeline", subject, path?, args?]` - property access or call on a
    /// possibly-unresolved subject.
    Pipeline {
        subject: i64,
        path: Vec<PropertyKey>,
        args: Option<Box<Expression>>,
    },
    /// `["remap", subject, path, captures, instructions]` - a recorded
    /// transform to replay against the subject.
    Remap {
        subject: i64,
        path: Vec<PropertyKey>,
        captures: Vec<CaptureRef>,
        instructions: Vec<Expression>,
    },
}

impl Expression {
    /// Parse an expression from a JSON value.
    pub fn from_json(value: &JsonValue) -> Result<Self, ExpressionError> {
        match value {
            JsonValue::Null => Ok(Expression::Null),
            JsonValue::Bool(b) => Ok(Expression::Bool(*b)),
            JsonValue::Number(n) => Ok(Expression::Number(n.clone())),
            JsonValue::String(s) => Ok(Expression::String(s.clone())),

            JsonValue::Array(arr) if arr.is_empty() => Ok(Expression::Array(Vec::new())),

            JsonValue::Array(arr) => {
                if let Some(JsonValue::String(tag)) = arr.first() {
                    Self::parse_typed_array(tag, arr)
                } else if arr.len() == 1 && arr[0].is_array() {
                    // Escaped literal array: [[...]]
                    let inner = arr[0].as_array().ok_or(ExpressionError::InvalidEscape)?;
                    let elements = inner
                        .iter()
                        .map(Self::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Expression::EscapedArray(elements))
                } else {
                    let elements = arr
                        .iter()
                        .map(Self::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Expression::Array(elements))
                }
            }

            JsonValue::Object(obj) => {
                let mut map = IndexMap::new();
                for (key, val) in obj {
                    map.insert(key.clone(), Self::from_json(val)?);
                }
                Ok(Expression::Object(map))
            }
        }
    }

    fn parse_typed_array(tag: &str, arr: &[JsonValue]) -> Result<Self, ExpressionError> {
        match tag {
            "undefined" => {
                if arr.len() != 1 {
                    return Err(ExpressionError::InvalidTaggedForm("undefined"));
                }
                Ok(Expression::Undefined)
            }

            "inf" => {
                if arr.len() != 1 {
                    return Err(ExpressionError::InvalidTaggedForm("inf"));
                }
                Ok(Expression::Inf)
            }

            "-inf" => {
                if arr.len() != 1 {
                    return Err(ExpressionError::InvalidTaggedForm("-inf"));
                }
                Ok(Expression::NegInf)
            }

            "nan" => {
                if arr.len() != 1 {
                    return Err(ExpressionError::InvalidTaggedForm("nan"));
                }
                Ok(Expression::Nan)
            }

            "bigint" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidTaggedForm("bigint"));
                }
                let digits = arr[1]
                    .as_str()
                    .ok_or(ExpressionError::InvalidTaggedForm("bigint"))?;
                if !is_decimal_integer(digits) {
                    return Err(ExpressionError::InvalidBigInt(digits.to_string()));
                }
                Ok(Expression::BigInt(digits.to_string()))
            }

            "date" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidTaggedForm("date"));
                }
                let millis = arr[1]
                    .as_f64()
                    .ok_or(ExpressionError::InvalidTaggedForm("date"))?;
                Ok(Expression::Date(millis))
            }

            "bytes" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidTaggedForm("bytes"));
                }
                let encoded = arr[1]
                    .as_str()
                    .ok_or(ExpressionError::InvalidTaggedForm("bytes"))?;
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| ExpressionError::InvalidBase64)?;
                Ok(Expression::Bytes(Bytes::from(raw)))
            }

            "error" => {
                if arr.len() < 3 || arr.len() > 4 {
                    return Err(ExpressionError::InvalidTaggedForm("error"));
                }
                let kind = arr[1]
                    .as_str()
                    .ok_or(ExpressionError::InvalidTaggedForm("error"))?;
                let message = arr[2]
                    .as_str()
                    .ok_or(ExpressionError::InvalidTaggedForm("error"))?
                    .to_string();
                let stack = arr.get(3).and_then(|v| v.as_str()).map(String::from);
                Ok(Expression::Error(ErrorExpression {
                    kind: ErrorKind::parse(kind),
                    message,
                    stack,
                }))
            }

            "import" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidTaggedForm("import"));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or(ExpressionError::InvalidTaggedForm("import"))?;
                Ok(Expression::Import(id))
            }

            "export" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidTaggedForm("export"));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or(ExpressionError::InvalidTaggedForm("export"))?;
                Ok(Expression::Export(id))
            }

            "pipeline" => {
                if arr.len() < 2 || arr.len() > 4 {
                    return Err(ExpressionError::InvalidTaggedForm("pipeline"));
                }
                let subject = arr[1]
                    .as_i64()
                    .ok_or(ExpressionError::InvalidTaggedForm("pipeline"))?;
                let path = match arr.get(2) {
                    Some(v) => PropertyKey::parse_path(v)?,
                    None => Vec::new(),
                };
                let args = arr
                    .get(3)
                    .map(|v| Expression::from_json(v).map(Box::new))
                    .transpose()?;
                Ok(Expression::Pipeline {
                    subject,
                    path,
                    args,
                })
            }

            "remap" => {
                if arr.len() != 5 {
                    return Err(ExpressionError::InvalidTaggedForm("remap"));
                }
                let subject = arr[1]
                    .as_i64()
                    .ok_or(ExpressionError::InvalidTaggedForm("remap"))?;
                let path = if arr[2].is_null() {
                    Vec::new()
                } else {
                    PropertyKey::parse_path(&arr[2])?
                };
                let captures = arr[3]
                    .as_array()
                    .ok_or(ExpressionError::InvalidTaggedForm("remap"))?
                    .iter()
                    .map(CaptureRef::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                let instructions = arr[4]
                    .as_array()
                    .ok_or(ExpressionError::InvalidTaggedForm("remap"))?
                    .iter()
                    .map(Expression::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                if instructions.is_empty() {
                    return Err(ExpressionError::EmptyInstructions);
                }
                Ok(Expression::Remap {
                    subject,
                    path,
                    captures,
                    instructions,
                })
            }

            _ => {
                // Unknown tag: a plain array that happens to start with a string.
                let elements = arr
                    .iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expression::Array(elements))
            }
        }
    }

    /// Convert the expression to its wire JSON form.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Expression::Null => JsonValue::Null,
            Expression::Bool(b) => JsonValue::Bool(*b),
            Expression::Number(n) => JsonValue::Number(n.clone()),
            Expression::String(s) => JsonValue::String(s.clone()),

            Expression::Array(elements) => {
                JsonValue::Array(elements.iter().map(|e| e.to_json()).collect())
            }

            Expression::EscapedArray(elements) => {
                let inner = elements.iter().map(|e| e.to_json()).collect();
                JsonValue::Array(vec![JsonValue::Array(inner)])
            }

            Expression::Object(map) => {
                let mut obj = serde_json::Map::new();
                for (key, val) in map {
                    obj.insert(key.clone(), val.to_json());
                }
                JsonValue::Object(obj)
            }

            Expression::Undefined => serde_json::json!(["undefined"]),
            Expression::Inf => serde_json::json!(["inf"]),
            Expression::NegInf => serde_json::json!(["-inf"]),
            Expression::Nan => serde_json::json!(["nan"]),
            Expression::BigInt(digits) => serde_json::json!(["bigint", digits]),
            Expression::Date(millis) => serde_json::json!(["date", millis]),

            Expression::Bytes(raw) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
                serde_json::json!(["bytes", encoded])
            }

            Expression::Error(err) => {
                if let Some(stack) = &err.stack {
                    serde_json::json!(["error", err.kind.as_str(), err.message, stack])
                } else {
                    serde_json::json!(["error", err.kind.as_str(), err.message])
                }
            }

            Expression::Import(id) => serde_json::json!(["import", id]),
            Expression::Export(id) => serde_json::json!(["export", id]),

            Expression::Pipeline {
                subject,
                path,
                args,
            } => {
                let mut arr = vec![
                    JsonValue::String("pipeline".into()),
                    JsonValue::Number(Number::from(*subject)),
                ];
                if !path.is_empty() || args.is_some() {
                    arr.push(PropertyKey::path_to_json(path));
                }
                if let Some(a) = args {
                    arr.push(a.to_json());
                }
                JsonValue::Array(arr)
            }

            Expression::Remap {
                subject,
                path,
                captures,
                instructions,
            } => {
                let path_json = if path.is_empty() {
                    JsonValue::Null
                } else {
                    PropertyKey::path_to_json(path)
                };
                let captures: Vec<JsonValue> = captures.iter().map(|c| c.to_json()).collect();
                let instructions: Vec<JsonValue> =
                    instructions.iter().map(|i| i.to_json()).collect();
                serde_json::json!(["remap", subject, path_json, captures, instructions])
            }
        }
    }

    /// Whether a literal array with these encoded elements must be wrapped
    /// to survive parsing: length-1 with an array inside, or leading with a
    /// string the decoder treats as an instruction tag.
    pub fn array_needs_escape(elements: &[Expression]) -> bool {
        match elements.first() {
            Some(Expression::String(s)) => KNOWN_TAGS.contains(&s.as_str()),
            Some(Expression::Array(_)) | Some(Expression::EscapedArray(_)) => elements.len() == 1,
            _ => false,
        }
    }
}

fn is_decimal_integer(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Invalid {0} expression")]
    InvalidTaggedForm(&'static str),

    #[error("Invalid escaped array")]
    InvalidEscape,

    #[error("Invalid property path")]
    InvalidPropertyPath,

    #[error("Forbidden property key: {0}")]
    ForbiddenKey(String),

    #[error("Invalid bigint digits: {0}")]
    InvalidBigInt(String),

    #[error("Invalid base64 payload")]
    InvalidBase64,

    #[error("Invalid capture reference")]
    InvalidCapture,

    #[error("Remap instruction list cannot be empty")]
    EmptyInstructions,
}
