use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use super::builder::BuilderShared;
use super::expression::{Expression, PropertyKey};
use super::ids::ImportId;
use super::payload::{navigate, ErrorValue, Navigated, Payload, Value};
use super::session::SessionCore;
use crate::error::RpcError;
use crate::RpcTarget;

/// One-shot notification that a capability is known dead.
pub type BrokenCallback = Box<dyn FnOnce(ErrorValue) + Send>;

/// Identity of a hook's underlying resource, for deduplication. Two hooks
/// compare equal only when the caller physically shares them (or their
/// dups). Imports are identified per session: equal ids from different
/// sessions are different capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookIdentity {
    Core(Uuid),
    Import(usize, i64),
}

/// A handle to a local or remote capability: the sole vehicle for
/// references. Every hook has exactly one logical owner; `dup` creates a
/// second owner and every owner must `dispose` exactly once.
#[derive(Debug)]
pub enum Hook {
    /// A local target (application object or function).
    Target(TargetHook),
    /// A hook over an owned local value.
    PayloadStub(PayloadStubHook),
    /// A capability imported from the peer.
    Import(ImportHook),
    /// A local eventual result.
    Promise(PromiseHook),
    /// The recording placeholder handed to map callbacks.
    MapVariable(MapVariable),
    /// A settled failure; also represents broken capabilities.
    Error(ErrorHook),
}

impl Hook {
    pub fn for_target(target: Arc<dyn RpcTarget>) -> Hook {
        Hook::Target(TargetHook::new(target))
    }

    pub fn for_value(value: Value) -> Hook {
        Hook::PayloadStub(PayloadStubHook::new(value))
    }

    pub fn error(error: ErrorValue) -> Hook {
        Hook::Error(ErrorHook::new(error, false))
    }

    pub fn broken(error: ErrorValue) -> Hook {
        Hook::Error(ErrorHook::new(error, true))
    }

    pub fn identity(&self) -> HookIdentity {
        match self {
            Hook::Target(h) => HookIdentity::Core(h.core.id),
            Hook::PayloadStub(h) => HookIdentity::Core(h.core.id),
            Hook::Import(h) => HookIdentity::Import(Arc::as_ptr(&h.session) as usize, h.id.0),
            Hook::Promise(h) => HookIdentity::Core(h.core.id),
            Hook::MapVariable(h) => HookIdentity::Core(h.id),
            Hook::Error(h) => HookIdentity::Core(h.id),
        }
    }

    /// Produce an independent reference, incrementing the underlying
    /// refcount.
    pub fn dup(&self) -> Hook {
        match self {
            Hook::Target(h) => {
                h.core.refs.fetch_add(1, Ordering::SeqCst);
                Hook::Target(TargetHook {
                    core: h.core.clone(),
                    path: h.path.clone(),
                })
            }
            Hook::PayloadStub(h) => {
                h.core.refs.fetch_add(1, Ordering::SeqCst);
                Hook::PayloadStub(PayloadStubHook {
                    core: h.core.clone(),
                    path: h.path.clone(),
                })
            }
            Hook::Import(h) => {
                h.session.add_import_ref(h.id);
                Hook::Import(ImportHook {
                    session: h.session.clone(),
                    id: h.id,
                    path: h.path.clone(),
                })
            }
            Hook::Promise(h) => {
                h.core.refs.fetch_add(1, Ordering::SeqCst);
                Hook::Promise(PromiseHook {
                    core: h.core.clone(),
                    path: h.path.clone(),
                })
            }
            Hook::MapVariable(h) => Hook::MapVariable(h.clone()),
            Hook::Error(h) => Hook::Error(h.clone()),
        }
    }

    /// Release one reference.
    pub fn dispose(self) {
        match self {
            Hook::Target(h) => drop_core_ref(&h.core.refs, || {}),
            Hook::PayloadStub(h) => drop_core_ref(&h.core.refs, || {
                if let Ok(mut guard) = h.core.value.lock() {
                    if let Some(value) = guard.take() {
                        value.dispose();
                    }
                }
            }),
            Hook::Import(h) => h.session.release_import_ref(h.id),
            Hook::Promise(h) => h.core.release_ref(),
            Hook::MapVariable(_) | Hook::Error(_) => {}
        }
    }

    /// A new hook addressing a sub-path. Never performs I/O.
    pub fn get(&self, path: &[PropertyKey]) -> Result<Hook, RpcError> {
        if path.is_empty() {
            return Ok(self.dup());
        }
        match self {
            Hook::Target(_) | Hook::PayloadStub(_) | Hook::Import(_) | Hook::Promise(_) => {
                let mut dup = self.dup();
                match &mut dup {
                    Hook::Target(h) => h.path.extend_from_slice(path),
                    Hook::PayloadStub(h) => h.path.extend_from_slice(path),
                    Hook::Import(h) => h.path.extend_from_slice(path),
                    Hook::Promise(h) => h.path.extend_from_slice(path),
                    _ => {}
                }
                Ok(dup)
            }
            Hook::MapVariable(h) => h.push_get(path),
            Hook::Error(_) => Ok(self.dup()),
        }
    }

    /// A new hook representing the eventual result of calling the member at
    /// `path`. Takes ownership of `args`.
    pub fn call(&self, path: &[PropertyKey], args: Vec<Value>) -> Result<Hook, RpcError> {
        match self {
            Hook::Target(h) => {
                let mut full = h.path.clone();
                full.extend_from_slice(path);
                let out = PromiseCore::new();
                let target = h.core.target.clone();
                let child = out.clone();
                tokio::spawn(async move {
                    dispatch_target_call(target, full, args, child).await;
                });
                Ok(Hook::Promise(PromiseHook::root(out)))
            }
            Hook::PayloadStub(h) => h.call(path, args),
            Hook::Import(h) => {
                let mut full = h.path.clone();
                full.extend_from_slice(path);
                Ok(h.session.pipeline_push(h.id, full, Some(args)))
            }
            Hook::Promise(h) => {
                let mut full = h.path.clone();
                full.extend_from_slice(path);
                Ok(h.core.call(full, args))
            }
            Hook::MapVariable(h) => h.push_call(path, args),
            Hook::Error(_) => {
                for arg in args {
                    arg.dispose();
                }
                Ok(self.dup())
            }
        }
    }

    /// Install a recorded transform; the result hook resolves to the mapped
    /// value. Takes ownership of `captures`.
    pub fn map_recorded(
        &self,
        path: &[PropertyKey],
        captures: Vec<Hook>,
        instructions: Vec<Expression>,
    ) -> Result<Hook, RpcError> {
        match self {
            Hook::Import(h) => {
                let mut full = h.path.clone();
                full.extend_from_slice(path);
                h.session.remap_push(h.id, full, captures, instructions)
            }
            Hook::MapVariable(_) => {
                for capture in captures {
                    capture.dispose();
                }
                Err(RpcError::map_misuse(
                    "cannot remap the abstract placeholder directly",
                ))
            }
            Hook::Error(_) => {
                for capture in captures {
                    capture.dispose();
                }
                Ok(self.dup())
            }
            // Local subjects replay the recording in-process.
            _ => {
                let subject = self.get(path)?;
                let out = PromiseCore::new();
                let child = out.clone();
                tokio::spawn(async move {
                    let input = subject.pull().await;
                    subject.dispose();
                    match input {
                        Ok(payload) => {
                            let result = super::applicator::apply_map(
                                payload,
                                captures,
                                &instructions,
                            )
                            .await;
                            child.settle_from(result);
                        }
                        Err(err) => {
                            for capture in captures {
                                capture.dispose();
                            }
                            child.reject(ErrorValue::from(err));
                        }
                    }
                });
                Ok(Hook::Promise(PromiseHook::root(out)))
            }
        }
    }

    /// Resolve to a payload; may suspend.
    pub async fn pull(&self) -> Result<Payload, RpcError> {
        match self {
            Hook::Target(h) => {
                if h.path.is_empty() {
                    Ok(Payload::new(Value::Stub(self.dup())))
                } else {
                    target_get(&h.core.target, &h.path).await
                }
            }
            Hook::PayloadStub(h) => h.pull().await,
            Hook::Import(h) => {
                if h.path.is_empty() {
                    h.session.pull_import(h.id).await
                } else {
                    let piped = h.session.pipeline_push(h.id, h.path.clone(), None);
                    let result = Box::pin(piped.pull()).await;
                    piped.dispose();
                    result
                }
            }
            Hook::Promise(h) => h.core.pull(&h.path).await,
            Hook::MapVariable(_) => Err(RpcError::map_misuse("map callbacks may not await")),
            Hook::Error(h) => Err(h.as_rpc_error()),
        }
    }

    /// Register a one-shot callback fired when the capability is known
    /// dead. Settled-successful hooks never fire it.
    pub fn on_broken(&self, cb: impl FnOnce(ErrorValue) + Send + 'static) {
        match self {
            Hook::Import(h) => h.session.import_on_broken(h.id, Box::new(cb)),
            Hook::Promise(h) => h.core.on_broken(Box::new(cb)),
            Hook::Error(h) => cb(h.error.clone()),
            Hook::MapVariable(_) => {
                warn!("on_broken is not available on the map placeholder");
            }
            Hook::Target(_) | Hook::PayloadStub(_) => {}
        }
    }
}

fn drop_core_ref(refs: &AtomicU32, on_zero: impl FnOnce()) {
    let prev = refs.fetch_sub(1, Ordering::SeqCst);
    if prev == 0 {
        // Underflow: dispose called more times than dup+construction.
        warn!("hook disposed more often than referenced");
        refs.store(0, Ordering::SeqCst);
        debug_assert!(false, "hook refcount underflow");
    } else if prev == 1 {
        on_zero();
    }
}

/// Unwrap a payload to the hook that represents it: a lone stub or promise
/// unwraps to its hook, anything else is wrapped as a payload stub.
pub fn payload_to_hook(payload: Payload) -> Hook {
    match payload.into_value() {
        Value::Stub(hook) => hook,
        Value::Promise(hook) => hook,
        value => Hook::for_value(value),
    }
}

// ---------------------------------------------------------------------------
// Local targets

pub struct TargetHook {
    pub(crate) core: Arc<TargetCore>,
    pub(crate) path: Vec<PropertyKey>,
}

pub(crate) struct TargetCore {
    pub(crate) id: Uuid,
    pub(crate) target: Arc<dyn RpcTarget>,
    pub(crate) refs: AtomicU32,
}

impl TargetHook {
    pub fn new(target: Arc<dyn RpcTarget>) -> Self {
        TargetHook {
            core: Arc::new(TargetCore {
                id: Uuid::new_v4(),
                target,
                refs: AtomicU32::new(1),
            }),
            path: Vec::new(),
        }
    }
}

impl std::fmt::Debug for TargetHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetHook")
            .field("id", &self.core.id)
            .field("path", &self.path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Payload stubs

pub struct PayloadStubHook {
    pub(crate) core: Arc<PayloadCore>,
    pub(crate) path: Vec<PropertyKey>,
}

pub(crate) struct PayloadCore {
    pub(crate) id: Uuid,
    pub(crate) refs: AtomicU32,
    pub(crate) value: Mutex<Option<Value>>,
}

impl PayloadStubHook {
    pub fn new(value: Value) -> Self {
        PayloadStubHook {
            core: Arc::new(PayloadCore {
                id: Uuid::new_v4(),
                refs: AtomicU32::new(1),
                value: Mutex::new(Some(value)),
            }),
            path: Vec::new(),
        }
    }

    async fn pull(&self) -> Result<Payload, RpcError> {
        let deferred = {
            let guard = self
                .core
                .value
                .lock()
                .map_err(|_| RpcError::internal("payload stub poisoned"))?;
            let value = guard
                .as_ref()
                .ok_or_else(|| RpcError::internal("payload stub already disposed"))?;
            match navigate(value, &self.path)? {
                Navigated::Value(v) => return Ok(Payload::new(v.deep_copy())),
                Navigated::Hook(hook, rest) => (hook.dup(), rest),
            }
        };
        let (hook, rest) = deferred;
        if rest.is_empty() {
            let result = Box::pin(hook.pull()).await;
            hook.dispose();
            return result;
        }
        let sub = hook.get(&rest)?;
        hook.dispose();
        let result = Box::pin(sub.pull()).await;
        sub.dispose();
        result
    }

    fn call(&self, path: &[PropertyKey], args: Vec<Value>) -> Result<Hook, RpcError> {
        let mut full = self.path.clone();
        full.extend_from_slice(path);
        let (hook, rest) = {
            let guard = self
                .core
                .value
                .lock()
                .map_err(|_| RpcError::internal("payload stub poisoned"))?;
            let value = guard
                .as_ref()
                .ok_or_else(|| RpcError::internal("payload stub already disposed"))?;
            match navigate(value, &full) {
                Ok(Navigated::Hook(hook, rest)) => (hook.dup(), rest),
                Ok(Navigated::Value(_)) => {
                    drop(guard);
                    for arg in args {
                        arg.dispose();
                    }
                    return Err(RpcError::target("value is not callable"));
                }
                Err(err) => {
                    drop(guard);
                    for arg in args {
                        arg.dispose();
                    }
                    return Err(err);
                }
            }
        };
        let result = hook.call(&rest, args);
        hook.dispose();
        result
    }
}

impl std::fmt::Debug for PayloadStubHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStubHook")
            .field("id", &self.core.id)
            .field("path", &self.path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Imports

#[derive(Debug)]
pub struct ImportHook {
    pub(crate) session: Arc<SessionCore>,
    pub(crate) id: ImportId,
    pub(crate) path: Vec<PropertyKey>,
}

impl ImportHook {
    pub(crate) fn new(session: Arc<SessionCore>, id: ImportId) -> Self {
        ImportHook {
            session,
            id,
            path: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Local promises

#[derive(Debug)]
pub struct PromiseHook {
    pub(crate) core: Arc<PromiseCore>,
    pub(crate) path: Vec<PropertyKey>,
}

impl PromiseHook {
    pub(crate) fn root(core: Arc<PromiseCore>) -> Self {
        PromiseHook {
            core,
            path: Vec::new(),
        }
    }
}

pub(crate) struct PromiseCore {
    pub(crate) id: Uuid,
    pub(crate) refs: AtomicU32,
    state: Mutex<PromiseState>,
    settled: watch::Sender<bool>,
}

enum PromiseState {
    Pending {
        queued: Vec<QueuedCall>,
        broken: Vec<BrokenCallback>,
    },
    Resolved(Payload),
    Rejected(ErrorValue),
    Disposed,
}

struct QueuedCall {
    path: Vec<PropertyKey>,
    args: Vec<Value>,
    out: Arc<PromiseCore>,
}

impl PromiseCore {
    pub(crate) fn new() -> Arc<Self> {
        let (settled, _) = watch::channel(false);
        Arc::new(PromiseCore {
            id: Uuid::new_v4(),
            refs: AtomicU32::new(1),
            state: Mutex::new(PromiseState::Pending {
                queued: Vec::new(),
                broken: Vec::new(),
            }),
            settled,
        })
    }

    /// Fulfill the promise. Queued pipelined calls drain in arrival order.
    pub(crate) fn resolve(self: &Arc<Self>, payload: Payload) {
        let drained = {
            let Ok(mut state) = self.state.lock() else {
                payload.dispose();
                return;
            };
            match &mut *state {
                PromiseState::Pending { queued, .. } => {
                    let queued = std::mem::take(queued);
                    if self.refs.load(Ordering::SeqCst) == 0 && queued.is_empty() {
                        // Every reference disposed before resolution: the
                        // value arrives as garbage.
                        *state = PromiseState::Disposed;
                        drop(state);
                        payload.dispose();
                        self.settled.send_replace(true);
                        return;
                    }
                    let subject = if queued.is_empty() {
                        None
                    } else {
                        Some(payload_subject(&payload))
                    };
                    *state = PromiseState::Resolved(payload);
                    (subject, queued)
                }
                _ => {
                    drop(state);
                    payload.dispose();
                    return;
                }
            }
        };
        let (subject, queued) = drained;
        self.settled.send_replace(true);
        if let Some(subject) = subject {
            for q in queued {
                match subject.call(&q.path, q.args) {
                    Ok(hook) => forward_hook(hook, q.out),
                    Err(err) => q.out.reject(ErrorValue::from(err)),
                }
            }
            subject.dispose();
            if self.refs.load(Ordering::SeqCst) == 0 {
                // All references were already gone; the drain above was the
                // last use of the stored value.
                if let Ok(mut state) = self.state.lock() {
                    if let PromiseState::Resolved(payload) =
                        std::mem::replace(&mut *state, PromiseState::Disposed)
                    {
                        payload.dispose();
                    }
                }
            }
        }
    }

    /// Reject the promise: queued calls reject, broken callbacks fire.
    pub(crate) fn reject(self: &Arc<Self>, error: ErrorValue) {
        let drained = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match &mut *state {
                PromiseState::Pending { queued, broken } => {
                    let queued = std::mem::take(queued);
                    let broken = std::mem::take(broken);
                    *state = PromiseState::Rejected(error.clone());
                    Some((queued, broken))
                }
                _ => None,
            }
        };
        self.settled.send_replace(true);
        if let Some((queued, broken)) = drained {
            for q in queued {
                for arg in q.args {
                    arg.dispose();
                }
                q.out.reject(error.clone());
            }
            for cb in broken {
                cb(error.clone());
            }
        }
    }

    pub(crate) fn settle_from(self: &Arc<Self>, result: Result<Payload, RpcError>) {
        match result {
            Ok(payload) => self.resolve(payload),
            Err(err) => self.reject(ErrorValue::from(err)),
        }
    }

    /// A fresh hook on this promise, addressing `path` within its eventual
    /// value.
    pub(crate) fn hook_at(self: &Arc<Self>, path: Vec<PropertyKey>) -> PromiseHook {
        self.refs.fetch_add(1, Ordering::SeqCst);
        PromiseHook {
            core: self.clone(),
            path,
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        match self.state.lock() {
            Ok(state) => !matches!(&*state, PromiseState::Pending { .. }),
            Err(_) => true,
        }
    }

    /// Drop one ownership reference; the last one disposes the contents.
    pub(crate) fn release_ref(self: &Arc<Self>) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            self.refs.store(0, Ordering::SeqCst);
            debug_assert!(false, "promise refcount underflow");
        } else if prev == 1 {
            self.clone().dispose_contents();
        }
    }

    pub(crate) fn call(self: &Arc<Self>, path: Vec<PropertyKey>, args: Vec<Value>) -> Hook {
        let out = PromiseCore::new();
        {
            let Ok(mut state) = self.state.lock() else {
                out.reject(ErrorValue::generic("promise poisoned"));
                return Hook::Promise(PromiseHook::root(out));
            };
            match &mut *state {
                PromiseState::Pending { queued, .. } => {
                    queued.push(QueuedCall {
                        path,
                        args,
                        out: out.clone(),
                    });
                    return Hook::Promise(PromiseHook::root(out));
                }
                PromiseState::Resolved(payload) => {
                    let subject = payload_subject(payload);
                    drop(state);
                    match subject.call(&path, args) {
                        Ok(hook) => forward_hook(hook, out.clone()),
                        Err(err) => out.reject(ErrorValue::from(err)),
                    }
                    subject.dispose();
                    return Hook::Promise(PromiseHook::root(out));
                }
                PromiseState::Rejected(error) => {
                    let error = error.clone();
                    drop(state);
                    for arg in args {
                        arg.dispose();
                    }
                    out.reject(error);
                    return Hook::Promise(PromiseHook::root(out));
                }
                PromiseState::Disposed => {
                    drop(state);
                    for arg in args {
                        arg.dispose();
                    }
                    out.reject(ErrorValue::generic("promise already disposed"));
                    return Hook::Promise(PromiseHook::root(out));
                }
            }
        }
    }

    pub(crate) async fn pull(self: &Arc<Self>, path: &[PropertyKey]) -> Result<Payload, RpcError> {
        let mut rx = self.settled.subscribe();
        loop {
            let deferred = {
                let state = self
                    .state
                    .lock()
                    .map_err(|_| RpcError::internal("promise poisoned"))?;
                match &*state {
                    PromiseState::Pending { .. } => None,
                    PromiseState::Resolved(payload) => match navigate(payload.value(), path)? {
                        Navigated::Value(v) => return Ok(Payload::new(v.deep_copy())),
                        Navigated::Hook(hook, rest) => Some((hook.dup(), rest)),
                    },
                    PromiseState::Rejected(error) => return Err(error.clone().into()),
                    PromiseState::Disposed => {
                        return Err(RpcError::internal("promise already disposed"))
                    }
                }
            };
            if let Some((hook, rest)) = deferred {
                let sub = if rest.is_empty() {
                    hook.dup()
                } else {
                    hook.get(&rest)?
                };
                hook.dispose();
                let result = Box::pin(sub.pull()).await;
                sub.dispose();
                return result;
            }
            rx.changed()
                .await
                .map_err(|_| RpcError::broken("promise abandoned"))?;
        }
    }

    pub(crate) fn on_broken(self: &Arc<Self>, cb: BrokenCallback) {
        let fire = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match &mut *state {
                PromiseState::Pending { broken, .. } => {
                    broken.push(cb);
                    None
                }
                PromiseState::Rejected(error) => Some((cb, error.clone())),
                _ => None,
            }
        };
        if let Some((cb, error)) = fire {
            cb(error);
        }
    }

    fn dispose_contents(self: Arc<Self>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match std::mem::replace(&mut *state, PromiseState::Disposed) {
            PromiseState::Resolved(payload) => payload.dispose(),
            PromiseState::Pending { queued, .. } => {
                // Still pending: leave the slot so a late resolution is
                // discarded as garbage rather than leaking its hooks.
                *state = PromiseState::Pending {
                    queued,
                    broken: Vec::new(),
                };
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for PromiseCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseCore").field("id", &self.id).finish()
    }
}

/// The hook queued operations run against once a promise settles.
fn payload_subject(payload: &Payload) -> Hook {
    match payload.value() {
        Value::Stub(hook) | Value::Promise(hook) => hook.dup(),
        other => Hook::for_value(other.deep_copy()),
    }
}

/// Settle `out` with whatever `hook` eventually produces.
pub(crate) fn forward_hook(hook: Hook, out: Arc<PromiseCore>) {
    tokio::spawn(async move {
        let result = hook.pull().await;
        hook.dispose();
        out.settle_from(result);
    });
}

// ---------------------------------------------------------------------------
// Map placeholders

/// The abstract placeholder handed to a recording callback in place of real
/// data. Operations on it append instructions to the active builder.
#[derive(Debug, Clone)]
pub struct MapVariable {
    pub(crate) id: Uuid,
    pub(crate) builder: Weak<BuilderShared>,
    pub(crate) index: i64,
}

impl MapVariable {
    pub(crate) fn new(builder: Weak<BuilderShared>, index: i64) -> Self {
        MapVariable {
            id: Uuid::new_v4(),
            builder,
            index,
        }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    /// Wrap as a value for use in arguments or as the callback result.
    pub fn into_value(self) -> Value {
        Value::Promise(Hook::MapVariable(self))
    }

    fn builder(&self) -> Result<Arc<BuilderShared>, RpcError> {
        self.builder
            .upgrade()
            .ok_or_else(|| RpcError::map_misuse("abstract placeholder used outside map"))
    }

    fn push_get(&self, path: &[PropertyKey]) -> Result<Hook, RpcError> {
        let builder = self.builder()?;
        let var = builder.push_get(self.index, path.to_vec())?;
        Ok(Hook::MapVariable(var))
    }

    fn push_call(&self, path: &[PropertyKey], args: Vec<Value>) -> Result<Hook, RpcError> {
        let builder = match self.builder() {
            Ok(b) => b,
            Err(err) => {
                for arg in args {
                    arg.dispose();
                }
                return Err(err);
            }
        };
        let var = builder.push_call(self.index, path.to_vec(), args)?;
        Ok(Hook::MapVariable(var))
    }
}

// ---------------------------------------------------------------------------
// Errors

#[derive(Debug, Clone)]
pub struct ErrorHook {
    pub(crate) id: Uuid,
    pub error: ErrorValue,
    pub broken: bool,
}

impl ErrorHook {
    pub fn new(error: ErrorValue, broken: bool) -> Self {
        ErrorHook {
            id: Uuid::new_v4(),
            error,
            broken,
        }
    }

    fn as_rpc_error(&self) -> RpcError {
        if self.broken {
            RpcError::broken(self.error.message.clone())
        } else {
            self.error.clone().into()
        }
    }
}

// ---------------------------------------------------------------------------
// Target dispatch

/// Pull every promise-valued argument to a concrete value so targets only
/// ever see settled data and stubs.
pub(crate) async fn resolve_args(args: Vec<Value>) -> Result<Vec<Value>, RpcError> {
    let mut resolved = Vec::with_capacity(args.len());
    for arg in args {
        resolved.push(resolve_value(arg).await?);
    }
    Ok(resolved)
}

/// Recursively replace promises with their settled values. Stubs stay.
pub(crate) fn resolve_value(
    value: Value,
) -> Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>> {
    Box::pin(async move {
        match value {
            Value::Promise(hook) => {
                let payload = hook.pull().await?;
                hook.dispose();
                resolve_value(payload.into_value()).await
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_value(item).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = indexmap::IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, resolve_value(v).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other),
        }
    })
}

async fn dispatch_target_call(
    target: Arc<dyn RpcTarget>,
    path: Vec<PropertyKey>,
    args: Vec<Value>,
    out: Arc<PromiseCore>,
) {
    let args = match resolve_args(args).await {
        Ok(args) => args,
        Err(err) => {
            out.reject(ErrorValue::from(err));
            return;
        }
    };
    let result = target_call(&target, &path, args).await;
    out.settle_from(result);
}

/// Invoke the member at `path` on a local target. Intermediate path segments
/// walk `get_property`; a stub encountered along the way takes over the rest
/// of the path.
pub(crate) async fn target_call(
    target: &Arc<dyn RpcTarget>,
    path: &[PropertyKey],
    args: Vec<Value>,
) -> Result<Payload, RpcError> {
    match path {
        [] => {
            let value = target.call("", args).await?;
            Ok(Payload::new(value))
        }
        [PropertyKey::String(method)] => {
            let value = target.call(method, args).await?;
            Ok(Payload::new(value))
        }
        [PropertyKey::Number(n)] => Err(RpcError::path(format!(
            "cannot call numeric member {} of a target",
            n
        ))),
        [head, rest @ ..] => {
            let PropertyKey::String(head) = head else {
                return Err(RpcError::path("cannot index a target with a number"));
            };
            let value = target.get_property(head).await?;
            let outcome = match navigate(&value, rest) {
                Ok(Navigated::Hook(hook, remaining)) => Ok((hook.dup(), remaining)),
                Ok(Navigated::Value(_)) => Err(RpcError::target("value is not callable")),
                Err(err) => Err(err),
            };
            match outcome {
                Ok((hook, remaining)) => {
                    value.dispose();
                    let result_hook = hook.call(&remaining, args)?;
                    hook.dispose();
                    let result = result_hook.pull().await;
                    result_hook.dispose();
                    result
                }
                Err(err) => {
                    value.dispose();
                    for arg in args {
                        arg.dispose();
                    }
                    Err(err)
                }
            }
        }
    }
}

/// Read the property at `path` from a local target.
pub(crate) async fn target_get(
    target: &Arc<dyn RpcTarget>,
    path: &[PropertyKey],
) -> Result<Payload, RpcError> {
    let [head, rest @ ..] = path else {
        return Err(RpcError::path("empty property path"));
    };
    let PropertyKey::String(head) = head else {
        return Err(RpcError::path("cannot index a target with a number"));
    };
    let value = target.get_property(head).await?;
    let deferred = match navigate(&value, rest) {
        Ok(Navigated::Value(v)) => Ok(Payload::new(v.deep_copy())),
        Ok(Navigated::Hook(hook, remaining)) => Err(Ok((hook.dup(), remaining))),
        Err(err) => Err(Err::<(Hook, Vec<PropertyKey>), RpcError>(err)),
    };
    value.dispose();
    match deferred {
        Ok(payload) => Ok(payload),
        Err(Ok((hook, remaining))) => {
            let sub = hook.get(&remaining)?;
            hook.dispose();
            let result = Box::pin(sub.pull()).await;
            sub.dispose();
            result
        }
        Err(Err(err)) => Err(err),
    }
}
