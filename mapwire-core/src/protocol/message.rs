use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::expression::{Expression, ExpressionError};
use super::ids::{ExportId, ImportId};

/// Protocol frames. Each frame is a JSON array with the tag first.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `["push", id, expression]` - allocate slot `id` and begin evaluating.
    Push(ImportId, Expression),

    /// `["pull", id]` - request resolution of `id`.
    Pull(ImportId),

    /// `["resolve", id, expression]` - fulfill `id` with a value.
    Resolve(ExportId, Expression),

    /// `["reject", id, expression]` - reject `id` with an error.
    Reject(ExportId, Expression),

    /// `["release", id, refcount]` - drop `refcount` references to `id`.
    Release(ExportId, u32),

    /// `["abort", reason?]` - end the session.
    Abort(Option<Expression>),
}

impl Message {
    /// Parse a frame from a JSON value.
    pub fn from_json(value: &JsonValue) -> Result<Self, MessageError> {
        let arr = value.as_array().ok_or(MessageError::NotAnArray)?;

        if arr.is_empty() {
            return Err(MessageError::EmptyFrame);
        }

        let tag = arr[0].as_str().ok_or(MessageError::InvalidTag)?;

        match tag {
            "push" => {
                if arr.len() != 3 {
                    return Err(MessageError::InvalidFrame("push"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                if id <= 0 {
                    return Err(MessageError::InvalidId);
                }
                let expr = Expression::from_json(&arr[2])?;
                Ok(Message::Push(ImportId(id), expr))
            }

            "pull" => {
                if arr.len() != 2 {
                    return Err(MessageError::InvalidFrame("pull"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                if id <= 0 {
                    return Err(MessageError::InvalidId);
                }
                Ok(Message::Pull(ImportId(id)))
            }

            "resolve" => {
                if arr.len() != 3 {
                    return Err(MessageError::InvalidFrame("resolve"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                if id == 0 {
                    return Err(MessageError::InvalidId);
                }
                let expr = Expression::from_json(&arr[2])?;
                Ok(Message::Resolve(ExportId(id), expr))
            }

            "reject" => {
                if arr.len() != 3 {
                    return Err(MessageError::InvalidFrame("reject"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                if id == 0 {
                    return Err(MessageError::InvalidId);
                }
                let expr = Expression::from_json(&arr[2])?;
                Ok(Message::Reject(ExportId(id), expr))
            }

            "release" => {
                if arr.len() != 3 {
                    return Err(MessageError::InvalidFrame("release"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                if id == 0 {
                    return Err(MessageError::ReleasedBootstrap);
                }
                let refcount = arr[2].as_u64().ok_or(MessageError::InvalidRefcount)?;
                if refcount == 0 || refcount > u32::MAX as u64 {
                    return Err(MessageError::InvalidRefcount);
                }
                Ok(Message::Release(ExportId(id), refcount as u32))
            }

            "abort" => {
                if arr.len() > 2 {
                    return Err(MessageError::InvalidFrame("abort"));
                }
                let reason = arr.get(1).map(Expression::from_json).transpose()?;
                Ok(Message::Abort(reason))
            }

            _ => Err(MessageError::UnknownTag(tag.to_string())),
        }
    }

    /// Convert the frame to its wire JSON form.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Message::Push(id, expr) => {
                serde_json::json!(["push", id.0, expr.to_json()])
            }
            Message::Pull(id) => {
                serde_json::json!(["pull", id.0])
            }
            Message::Resolve(id, expr) => {
                serde_json::json!(["resolve", id.0, expr.to_json()])
            }
            Message::Reject(id, expr) => {
                serde_json::json!(["reject", id.0, expr.to_json()])
            }
            Message::Release(id, refcount) => {
                serde_json::json!(["release", id.0, refcount])
            }
            Message::Abort(None) => {
                serde_json::json!(["abort"])
            }
            Message::Abort(Some(reason)) => {
                serde_json::json!(["abort", reason.to_json()])
            }
        }
    }
}

/// Parse a single frame from raw bytes.
pub fn parse_frame(frame: &[u8]) -> Result<Message, MessageError> {
    let json: JsonValue =
        serde_json::from_slice(frame).map_err(|e| MessageError::InvalidJson(e.to_string()))?;
    Message::from_json(&json)
}

/// Serialize a single frame to raw bytes.
pub fn write_frame(msg: &Message) -> Bytes {
    // Serializing a JsonValue tree cannot fail.
    let raw = serde_json::to_vec(&msg.to_json()).unwrap_or_default();
    Bytes::from(raw)
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        Message::from_json(&value).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Frame must be a JSON array")]
    NotAnArray,

    #[error("Frame array cannot be empty")]
    EmptyFrame,

    #[error("Frame tag must be a string")]
    InvalidTag,

    #[error("Invalid {0} frame")]
    InvalidFrame(&'static str),

    #[error("Invalid id")]
    InvalidId,

    #[error("Invalid refcount")]
    InvalidRefcount,

    #[error("The bootstrap id cannot be released")]
    ReleasedBootstrap,

    #[error("Unknown frame tag: {0}")]
    UnknownTag(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),
}
