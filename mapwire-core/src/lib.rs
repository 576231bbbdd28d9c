//! Record/replay capability RPC core.
//!
//! Bidirectional object RPC over a duplex byte-framed transport, built
//! around three pieces: refcounted import/export tables with promise
//! pipelining, a deterministic value codec, and a map protocol that ships
//! caller-supplied transforms as recorded instruction lists replayed at the
//! data's home.

pub mod error;
pub mod protocol;

pub use error::{ErrorCode, ErrorKind, RpcError};
pub use protocol::{
    apply_map, channel_transport, devaluate, evaluate, ChannelTransport, ErrorValue, Expression,
    ExportId, Hook, ImportId, MapBuilder, MapVariable, Message, Payload, PropertyKey, RpcSession,
    SessionError, Transport, TransportError, Value,
};

use async_trait::async_trait;

/// A capability implementation supplied by the application. Targets are
/// exported into the session's tables and invoked by incoming calls.
#[async_trait]
pub trait RpcTarget: Send + Sync + std::fmt::Debug {
    /// Call a method on this capability.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;

    /// Get a property of this capability.
    async fn get_property(&self, property: &str) -> Result<Value, RpcError>;
}

/// Adapter exposing a plain function as a capability. The closure receives
/// every method name; properties are not available.
pub struct FnTarget<F> {
    f: F,
}

impl<F> FnTarget<F>
where
    F: Fn(&str, Vec<Value>) -> Result<Value, RpcError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnTarget { f }
    }
}

#[async_trait]
impl<F> RpcTarget for FnTarget<F>
where
    F: Fn(&str, Vec<Value>) -> Result<Value, RpcError> + Send + Sync,
{
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        (self.f)(method, args)
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Err(RpcError::path(format!(
            "functions have no properties (asked for {})",
            property
        )))
    }
}

impl<F> std::fmt::Debug for FnTarget<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTarget").finish()
    }
}
