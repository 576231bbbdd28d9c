use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Error categories for the runtime.
///
/// `Protocol` failures are fatal to the session; everything else is scoped
/// to a single call or hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Protocol,
    MapMisuse,
    Path,
    Target,
    Broken,
    Canceled,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Protocol => "protocol",
            ErrorCode::MapMisuse => "map_misuse",
            ErrorCode::Path => "path",
            ErrorCode::Target => "target",
            ErrorCode::Broken => "broken",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: JsonValue) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    pub fn map_misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MapMisuse, message)
    }

    pub fn path(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Path, message)
    }

    pub fn target(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Target, message)
    }

    pub fn broken(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Broken, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::protocol(format!("JSON error: {}", err))
    }
}

/// Wire-level error kinds, the fixed set carried by `["error", kind, ...]`.
///
/// Unknown kinds decode to `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Generic,
    Eval,
    Range,
    Reference,
    Syntax,
    Type,
    Uri,
    Aggregate,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Generic => "generic",
            ErrorKind::Eval => "eval",
            ErrorKind::Range => "range",
            ErrorKind::Reference => "reference",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Type => "type",
            ErrorKind::Uri => "uri",
            ErrorKind::Aggregate => "aggregate",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "eval" => ErrorKind::Eval,
            "range" => ErrorKind::Range,
            "reference" => ErrorKind::Reference,
            "syntax" => ErrorKind::Syntax,
            "type" => ErrorKind::Type,
            "uri" => ErrorKind::Uri,
            "aggregate" => ErrorKind::Aggregate,
            _ => ErrorKind::Generic,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
