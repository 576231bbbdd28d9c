// Protocol runtime: capability tables, value codec, map record/replay, and
// the session message loop.

pub mod applicator;
pub mod builder;
pub mod devaluator;
pub mod evaluator;
pub mod expression;
pub mod hooks;
pub mod ids;
pub mod message;
pub mod payload;
pub mod session;
pub mod tables;

pub use applicator::{apply_map, MapApplicator};
pub use builder::MapBuilder;
pub use devaluator::{devaluate, Exporter, PlainExporter};
pub use evaluator::{evaluate, Importer, PlainImporter};
pub use expression::{
    is_forbidden_key, CaptureRef, ErrorExpression, Expression, ExpressionError, PropertyKey,
    FORBIDDEN_KEYS,
};
pub use hooks::{Hook, HookIdentity, MapVariable};
pub use ids::{ExportId, IdAllocator, ImportId};
pub use message::{parse_frame, write_frame, Message, MessageError};
pub use payload::{navigate, ErrorValue, Navigated, Payload, Value};
pub use session::{
    channel_transport, ChannelTransport, RpcSession, SessionError, Transport, TransportError,
};
pub use tables::{ExportTable, ImportTable, PendingRelease, TableError};
