use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::devaluator::{devaluate, devaluate_value, Exporter};
use super::evaluator::{evaluate, Importer};
use super::expression::{CaptureRef, ErrorExpression, Expression, PropertyKey};
use super::hooks::{payload_to_hook, BrokenCallback, Hook, ImportHook};
use super::ids::{ExportId, IdAllocator, ImportId};
use super::message::{parse_frame, write_frame, Message, MessageError};
use super::payload::{ErrorValue, Payload, Value};
use super::tables::{ExportTable, ImportTable, TableError};
use crate::error::RpcError;
use crate::RpcTarget;

/// The byte-framed duplex the session speaks through. Framing and
/// connection lifecycle live outside the core: `recv` yields whole frames,
/// `send` accepts whole frames.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// The next incoming frame, or `None` when the peer is gone. Must be
    /// cancel-safe: the session drops and re-creates this future while
    /// interleaving sends.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport failure: {0}")]
    Io(String),
}

/// An in-memory transport pair, for tests and same-process peers.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

pub fn channel_transport() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport { tx: a_tx, rx: b_rx },
        ChannelTransport { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// A point-to-point RPC session: one reader loop over framed messages,
/// dispatching push/pull/resolve/reject/release/abort against the
/// capability tables.
pub struct RpcSession {
    core: Arc<SessionCore>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

pub(crate) struct SessionCore {
    pub(crate) me: Weak<SessionCore>,
    pub(crate) allocator: Arc<IdAllocator>,
    pub(crate) imports: ImportTable,
    pub(crate) exports: ExportTable,
    outgoing: mpsc::UnboundedSender<Message>,
    aborted: Mutex<Option<ErrorValue>>,
}

impl RpcSession {
    /// A new session exporting `bootstrap` at id 0.
    pub fn new(bootstrap: Arc<dyn RpcTarget>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let allocator = Arc::new(IdAllocator::new());
        let core = Arc::new_cyclic(|me| SessionCore {
            me: me.clone(),
            allocator: allocator.clone(),
            imports: ImportTable::new(),
            exports: ExportTable::new(allocator),
            outgoing: tx,
            aborted: Mutex::new(None),
        });
        core.exports.insert_bootstrap(Hook::for_target(bootstrap));
        core.imports.insert_bootstrap();
        RpcSession {
            core,
            outgoing_rx: Mutex::new(Some(rx)),
        }
    }

    /// A hook on the peer's bootstrap object.
    pub fn bootstrap(&self) -> Hook {
        self.core.imports.add_local_ref(ImportId::bootstrap());
        Hook::Import(ImportHook::new(self.core.clone(), ImportId::bootstrap()))
    }

    /// Drive the session until abort, transport closure, or a protocol
    /// error. Fatal errors send an `abort` frame before returning.
    pub async fn run<T: Transport>(&self, mut transport: T) -> Result<(), SessionError> {
        let mut outgoing = {
            let mut guard = self
                .outgoing_rx
                .lock()
                .map_err(|_| SessionError::Protocol("session state poisoned".into()))?;
            guard.take().ok_or(SessionError::AlreadyRunning)?
        };

        enum Event {
            Incoming(Option<Bytes>),
            Outgoing(Option<Message>),
            Failed(TransportError),
        }

        let result = loop {
            // The recv future lives only inside this block so the transport
            // is free again for sends once an event is chosen.
            let event = {
                let incoming = transport.recv();
                tokio::pin!(incoming);
                tokio::select! {
                    frame = &mut incoming => match frame {
                        Ok(frame) => Event::Incoming(frame),
                        Err(err) => Event::Failed(err),
                    },
                    msg = outgoing.recv() => Event::Outgoing(msg),
                }
            };
            match event {
                Event::Incoming(Some(bytes)) => {
                    let msg = match parse_frame(&bytes) {
                        Ok(msg) => msg,
                        Err(err) => break Err(SessionError::Frame(err)),
                    };
                    debug!(?msg, "frame received");
                    match self.handle_message(msg) {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(err) => break Err(err),
                    }
                }
                Event::Incoming(None) => {
                    self.core.teardown(ErrorValue::broken("transport closed"));
                    return Ok(());
                }
                Event::Outgoing(Some(msg)) => {
                    debug!(?msg, "frame sent");
                    if let Err(err) = transport.send(write_frame(&msg)).await {
                        break Err(SessionError::Transport(err));
                    }
                }
                Event::Outgoing(None) => {}
                Event::Failed(err) => break Err(SessionError::Transport(err)),
            }
        };

        match result {
            Ok(()) => {
                self.core.teardown(ErrorValue::broken("session aborted by peer"));
                Ok(())
            }
            Err(err) => {
                let reason = ErrorValue::broken(err.to_string());
                let abort = Message::Abort(Some(Expression::Error(ErrorExpression {
                    kind: reason.kind,
                    message: reason.message.clone(),
                    stack: None,
                })));
                let _ = transport.send(write_frame(&abort)).await;
                self.core.teardown(reason);
                Err(err)
            }
        }
    }

    /// Dispatch one frame. `Ok(false)` ends the loop gracefully.
    fn handle_message(&self, msg: Message) -> Result<bool, SessionError> {
        match msg {
            Message::Push(id, expr) => {
                let export_id = id.to_export_id();
                if self.core.exports.contains(export_id) {
                    return Err(SessionError::Protocol(format!(
                        "push of an id already in use: {}",
                        id
                    )));
                }
                let payload = evaluate(expr, &*self.core).map_err(SessionError::fatal)?;
                let hook = payload_to_hook(payload);
                self.core
                    .exports
                    .insert_pushed(export_id, hook)
                    .map_err(SessionError::from)?;
                Ok(true)
            }

            Message::Pull(id) => {
                let export_id = id.to_export_id();
                let hook = self
                    .core
                    .exports
                    .get(export_id)
                    .ok_or_else(|| {
                        SessionError::Protocol(format!("pull of an unknown id: {}", id))
                    })?;
                let core = self.core.clone();
                tokio::spawn(async move {
                    let result = hook.pull().await;
                    hook.dispose();
                    core.send_pull_outcome(export_id, result);
                });
                Ok(true)
            }

            Message::Resolve(id, expr) => {
                let import_id = id.to_import_id();
                let slot = self.core.imports.slot(import_id).ok_or_else(|| {
                    SessionError::Protocol(format!("resolve of an unknown id: {}", import_id))
                })?;
                let payload = evaluate(expr, &*self.core).map_err(SessionError::fatal)?;
                slot.resolve(payload);
                self.core.imports.consume_remote_on_settle(import_id);
                Ok(true)
            }

            Message::Reject(id, expr) => {
                let import_id = id.to_import_id();
                let slot = self.core.imports.slot(import_id).ok_or_else(|| {
                    SessionError::Protocol(format!("reject of an unknown id: {}", import_id))
                })?;
                let payload = evaluate(expr, &*self.core).map_err(SessionError::fatal)?;
                let error = match payload.into_value() {
                    Value::Error(err) => err,
                    other => {
                        other.dispose();
                        ErrorValue::generic("call rejected")
                    }
                };
                slot.reject(error);
                self.core.imports.consume_remote_on_settle(import_id);
                Ok(true)
            }

            Message::Release(id, refcount) => {
                self.core
                    .exports
                    .release(id, refcount)
                    .map_err(SessionError::from)?;
                Ok(true)
            }

            Message::Abort(reason) => {
                let error = match reason {
                    Some(Expression::Error(err)) => {
                        let mut error = ErrorValue::broken(err.message);
                        error.kind = err.kind;
                        error.stack = err.stack;
                        error
                    }
                    _ => ErrorValue::broken("session aborted by peer"),
                };
                self.core.teardown(error);
                Ok(false)
            }
        }
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession").finish()
    }
}

impl SessionCore {
    fn me(&self) -> Option<Arc<SessionCore>> {
        self.me.upgrade()
    }

    fn abort_reason(&self) -> Option<ErrorValue> {
        self.aborted.lock().ok().and_then(|guard| guard.clone())
    }

    fn send_message(&self, msg: Message) {
        if self.abort_reason().is_some() {
            return;
        }
        let _ = self.outgoing.send(msg);
    }

    fn send_pull_outcome(&self, id: ExportId, result: Result<Payload, RpcError>) {
        if !self.exports.contains(id) {
            // Released while the pull was in flight; nobody wants it.
            if let Ok(payload) = result {
                payload.dispose();
            }
            return;
        }
        match result {
            Ok(payload) => match devaluate(payload, self) {
                Ok(expr) => self.send_message(Message::Resolve(id, expr)),
                Err(err) => self.send_message(Message::Reject(
                    id,
                    error_expression(&ErrorValue::from(err)),
                )),
            },
            Err(err) => {
                self.send_message(Message::Reject(id, error_expression(&ErrorValue::from(err))));
            }
        }
        // The resolution consumes one wire reference.
        match self.exports.release(id, 1) {
            Ok(_) => {}
            Err(err) => warn!(%id, %err, "release after resolution failed"),
        }
    }

    pub(crate) fn add_import_ref(&self, id: ImportId) {
        self.imports.add_local_ref(id);
    }

    pub(crate) fn release_import_ref(&self, id: ImportId) {
        let pending = self.imports.release_local(id);
        if let Some(count) = pending.send {
            self.send_message(Message::Release(ExportId(id.0), count));
        }
    }

    /// Push a pipelined operation on `subject` and import the result.
    pub(crate) fn pipeline_push(
        self: &Arc<Self>,
        subject: ImportId,
        path: Vec<PropertyKey>,
        args: Option<Vec<Value>>,
    ) -> Hook {
        if let Some(reason) = self.abort_reason() {
            if let Some(args) = args {
                for arg in args {
                    arg.dispose();
                }
            }
            return Hook::broken(reason);
        }
        // Once an import has settled, its wire id is spent; further
        // operations dispatch against the resolved value instead.
        if let Some(slot) = self.imports.slot(subject) {
            if slot.is_settled() {
                return match args {
                    Some(values) => slot.call(path, values),
                    None => Hook::Promise(slot.hook_at(path)),
                };
            }
        }
        let args_expr = match args {
            None => None,
            Some(values) => match devaluate_value(Value::Array(values), &**self) {
                Ok(expr) => Some(Box::new(expr)),
                Err(err) => return Hook::error(ErrorValue::from(err)),
            },
        };
        let id = self.allocator.allocate_import();
        self.imports.insert_pushed(id);
        self.send_message(Message::Push(
            id,
            Expression::Pipeline {
                subject: subject.0,
                path,
                args: args_expr,
            },
        ));
        Hook::Import(ImportHook::new(self.clone(), id))
    }

    /// Push a recorded transform on `subject` and import the eventual
    /// mapped result. Takes ownership of the capture hooks.
    pub(crate) fn remap_push(
        self: &Arc<Self>,
        subject: ImportId,
        path: Vec<PropertyKey>,
        captures: Vec<Hook>,
        instructions: Vec<Expression>,
    ) -> Result<Hook, RpcError> {
        if let Some(reason) = self.abort_reason() {
            for capture in captures {
                capture.dispose();
            }
            return Ok(Hook::broken(reason));
        }
        if let Some(slot) = self.imports.slot(subject) {
            if slot.is_settled() {
                // The wire id is spent; replay locally against the
                // resolved value.
                let subject_hook = Hook::Promise(slot.hook_at(path));
                let result = subject_hook.map_recorded(&[], captures, instructions);
                subject_hook.dispose();
                return result;
            }
        }
        let mut capture_refs = Vec::with_capacity(captures.len());
        for capture in captures {
            match capture {
                Hook::Import(h) if std::ptr::eq(Arc::as_ptr(&h.session), Arc::as_ptr(self)) => {
                    if h.path.is_empty() {
                        capture_refs.push(CaptureRef::Import(h.id.0));
                        Hook::Import(h).dispose();
                    } else {
                        // A path-extended import has no id of its own yet;
                        // materialize it as a pipelined push.
                        let piped = self.pipeline_push(h.id, h.path.clone(), None);
                        if let Hook::Import(p) = &piped {
                            capture_refs.push(CaptureRef::Import(p.id.0));
                        }
                        piped.dispose();
                        Hook::Import(h).dispose();
                    }
                }
                other => {
                    let id = self.exports.export(other);
                    capture_refs.push(CaptureRef::Export(id.0));
                }
            }
        }
        let id = self.allocator.allocate_import();
        self.imports.insert_pushed(id);
        self.send_message(Message::Push(
            id,
            Expression::Remap {
                subject: subject.0,
                path,
                captures: capture_refs,
                instructions,
            },
        ));
        Ok(Hook::Import(ImportHook::new(self.clone(), id)))
    }

    /// Await the value of an import. Settled capability imports resolve
    /// locally; promise imports send a single `pull` frame.
    pub(crate) async fn pull_import(self: &Arc<Self>, id: ImportId) -> Result<Payload, RpcError> {
        if self.imports.is_settled_stub(id) {
            self.imports.add_local_ref(id);
            return Ok(Payload::new(Value::Stub(Hook::Import(ImportHook::new(
                self.clone(),
                id,
            )))));
        }
        let slot = self
            .imports
            .slot(id)
            .ok_or_else(|| RpcError::broken("import already released"))?;
        if self.imports.mark_pulled(id) {
            self.send_message(Message::Pull(id));
        }
        slot.pull(&[]).await
    }

    pub(crate) fn import_on_broken(&self, id: ImportId, cb: BrokenCallback) {
        match self.imports.slot(id) {
            Some(slot) => slot.on_broken(cb),
            None => cb(ErrorValue::broken("import already released")),
        }
    }

    /// End the session: every pending import rejects as broken, every
    /// export is disposed, and nothing further goes on the wire.
    pub(crate) fn teardown(&self, reason: ErrorValue) {
        {
            let Ok(mut aborted) = self.aborted.lock() else {
                return;
            };
            if aborted.is_some() {
                return;
            }
            *aborted = Some(reason.clone());
        }
        debug!(%reason, "session teardown");
        for (_, slot) in self.imports.drain() {
            slot.reject(reason.clone());
            slot.release_ref();
        }
        self.exports.drain();
    }
}

impl Exporter for SessionCore {
    fn export_stub(&self, hook: Hook) -> Result<Expression, RpcError> {
        let id = self.exports.export(hook);
        Ok(Expression::Export(id.0))
    }

    fn export_promise(&self, hook: Hook) -> Result<Expression, RpcError> {
        let id = self.exports.export(hook);
        Ok(Expression::Export(id.0))
    }

    fn translate_import(&self, hook: &Hook) -> Option<Expression> {
        match hook {
            Hook::Import(h) if std::ptr::eq(Arc::as_ptr(&h.session), self) => {
                if h.path.is_empty() {
                    Some(Expression::Import(h.id.0))
                } else {
                    // A promise being actively pipelined.
                    Some(Expression::Pipeline {
                        subject: h.id.0,
                        path: h.path.clone(),
                        args: None,
                    })
                }
            }
            _ => None,
        }
    }
}

impl Importer for SessionCore {
    fn import_stub(&self, id: ImportId) -> Result<Hook, RpcError> {
        if id.0 >= 0 {
            return Err(RpcError::protocol(format!(
                "peer introduced a capability with a non-exporter id: {}",
                id
            )));
        }
        let session = self
            .me()
            .ok_or_else(|| RpcError::broken("session is gone"))?;
        self.imports.import_introduced(id);
        Ok(Hook::Import(ImportHook::new(session, id)))
    }

    fn import_promise(&self, id: ImportId) -> Result<Hook, RpcError> {
        self.import_stub(id)
    }

    fn lookup_export(&self, id: ExportId) -> Result<Hook, RpcError> {
        self.exports
            .get(id)
            .ok_or_else(|| RpcError::protocol(format!("reference to an unknown id: {}", id)))
    }
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("imports", &self.imports)
            .field("exports", &self.exports)
            .finish()
    }
}

fn error_expression(error: &ErrorValue) -> Expression {
    Expression::Error(ErrorExpression {
        kind: error.kind,
        message: error.message.clone(),
        stack: error.stack.clone(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed frame: {0}")]
    Frame(#[from] MessageError),

    #[error("The session is already running")]
    AlreadyRunning,
}

impl SessionError {
    fn fatal(err: RpcError) -> SessionError {
        SessionError::Protocol(err.message)
    }
}

impl From<TableError> for SessionError {
    fn from(err: TableError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
