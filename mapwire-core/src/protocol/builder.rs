use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::devaluator::{devaluate_value, Exporter};
use super::expression::{CaptureRef, Expression, PropertyKey};
use super::hooks::{Hook, HookIdentity, MapVariable};
use super::payload::Value;
use crate::error::RpcError;

/// Records the operations a map callback performs against its placeholder,
/// producing the instruction list shipped inside a `remap`.
///
/// There is no ambient "current builder": the builder handle itself is the
/// recording context, and placeholders hold a weak reference back to it.
/// Builders nest through [`MapBuilder::map`].
pub struct MapBuilder {
    shared: Arc<BuilderShared>,
}

pub(crate) struct BuilderShared {
    parent: Option<Arc<BuilderShared>>,
    inner: Mutex<BuilderInner>,
}

struct BuilderInner {
    captures: Vec<Captured>,
    capture_map: HashMap<HookIdentity, i64>,
    instructions: Vec<Expression>,
    next_variable: i64,
    finished: bool,
}

enum Captured {
    /// Top-level recording: the builder owns the captured hook.
    Hook(Hook),
    /// Nested recording: an index into the enclosing scope.
    ParentIndex(i64),
}

/// How a captured hook is referenced from inside the instruction list.
/// Evaluating it yields a promise for the capture, which argument
/// resolution pulls to a concrete value or capability.
fn capture_reference(index: i64) -> Expression {
    Expression::Pipeline {
        subject: index,
        path: Vec::new(),
        args: None,
    }
}

impl BuilderShared {
    fn new(parent: Option<Arc<BuilderShared>>) -> Arc<Self> {
        Arc::new(BuilderShared {
            parent,
            inner: Mutex::new(BuilderInner {
                captures: Vec::new(),
                capture_map: HashMap::new(),
                instructions: Vec::new(),
                next_variable: 1,
                finished: false,
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BuilderInner>, RpcError> {
        self.inner
            .lock()
            .map_err(|_| RpcError::internal("map recording poisoned"))
    }

    fn check_open(inner: &BuilderInner) -> Result<(), RpcError> {
        if inner.finished {
            Err(RpcError::map_misuse("recording already finished"))
        } else {
            Ok(())
        }
    }

    /// Record a property access; the result is a fresh variable.
    pub(crate) fn push_get(
        self: &Arc<Self>,
        subject: i64,
        path: Vec<PropertyKey>,
    ) -> Result<MapVariable, RpcError> {
        let mut inner = self.lock()?;
        Self::check_open(&inner)?;
        trace!(subject, ?path, "recording property access");
        inner.instructions.push(Expression::Pipeline {
            subject,
            path,
            args: None,
        });
        let index = inner.next_variable;
        inner.next_variable += 1;
        Ok(MapVariable::new(Arc::downgrade(self), index))
    }

    /// Record a method call; arguments are encoded with this builder as the
    /// exporter so placeholders and captures become indices.
    pub(crate) fn push_call(
        self: &Arc<Self>,
        subject: i64,
        path: Vec<PropertyKey>,
        args: Vec<Value>,
    ) -> Result<MapVariable, RpcError> {
        {
            let inner = self.lock()?;
            Self::check_open(&inner)?;
        }
        let args_expr = devaluate_value(Value::Array(args), &**self)?;
        let mut inner = self.lock()?;
        Self::check_open(&inner)?;
        trace!(subject, ?path, "recording call");
        inner.instructions.push(Expression::Pipeline {
            subject,
            path,
            args: Some(Box::new(args_expr)),
        });
        let index = inner.next_variable;
        inner.next_variable += 1;
        Ok(MapVariable::new(Arc::downgrade(self), index))
    }

    /// Resolve a hook to a recording index: placeholders of this builder
    /// keep their positive index; anything else is captured at a negative
    /// index, deduplicated by identity within this builder only.
    pub(crate) fn capture(&self, hook: &Hook) -> Result<i64, RpcError> {
        if let Hook::MapVariable(var) = hook {
            if let Some(owner) = var.builder.upgrade() {
                if std::ptr::eq(Arc::as_ptr(&owner), self) {
                    return Ok(var.index);
                }
                if let Some(parent) = &self.parent {
                    // A placeholder from an enclosing recording: capture its
                    // index in the parent scope.
                    let parent_index = parent.capture(hook)?;
                    return self.store_parent_capture(hook, parent_index);
                }
            }
            return Err(RpcError::map_misuse(
                "abstract placeholder used outside map",
            ));
        }

        {
            let inner = self.lock()?;
            Self::check_open(&inner)?;
            if let Some(index) = inner.capture_map.get(&hook.identity()) {
                return Ok(*index);
            }
        }

        match &self.parent {
            Some(parent) => {
                let parent_index = parent.capture(hook)?;
                self.store_parent_capture(hook, parent_index)
            }
            None => {
                let mut inner = self.lock()?;
                Self::check_open(&inner)?;
                inner.captures.push(Captured::Hook(hook.dup()));
                let index = -(inner.captures.len() as i64);
                inner.capture_map.insert(hook.identity(), index);
                trace!(index, "captured hook");
                Ok(index)
            }
        }
    }

    fn store_parent_capture(&self, hook: &Hook, parent_index: i64) -> Result<i64, RpcError> {
        let mut inner = self.lock()?;
        Self::check_open(&inner)?;
        if let Some(index) = inner.capture_map.get(&hook.identity()) {
            return Ok(*index);
        }
        inner.captures.push(Captured::ParentIndex(parent_index));
        let index = -(inner.captures.len() as i64);
        inner.capture_map.insert(hook.identity(), index);
        Ok(index)
    }

    /// Encode the callback's return value as the final instruction and
    /// close the recording.
    fn finish(self: &Arc<Self>, value: Value) -> Result<(), RpcError> {
        let final_expr = match devaluate_value(value, &**self) {
            Ok(expr) => expr,
            Err(err) => {
                self.abandon();
                return Err(err);
            }
        };
        let mut inner = self.lock()?;
        Self::check_open(&inner)?;
        inner.instructions.push(final_expr);
        inner.finished = true;
        Ok(())
    }

    /// Close the recording without an output, releasing captured hooks.
    fn abandon(self: &Arc<Self>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.finished = true;
            for captured in inner.captures.drain(..) {
                if let Captured::Hook(hook) = captured {
                    hook.dispose();
                }
            }
        }
    }

    fn take_recording(self: &Arc<Self>) -> Result<(Vec<Captured>, Vec<Expression>), RpcError> {
        let mut inner = self.lock()?;
        let captures = std::mem::take(&mut inner.captures);
        let instructions = std::mem::take(&mut inner.instructions);
        Ok((captures, instructions))
    }
}

impl Exporter for BuilderShared {
    fn export_stub(&self, hook: Hook) -> Result<Expression, RpcError> {
        hook.dispose();
        Err(RpcError::map_misuse(
            "cannot construct a local target inside a mapper",
        ))
    }

    fn export_promise(&self, hook: Hook) -> Result<Expression, RpcError> {
        if matches!(hook, Hook::MapVariable(_)) {
            hook.dispose();
            return Err(RpcError::map_misuse(
                "abstract placeholder used outside map",
            ));
        }
        // A pending value in the recording output means the callback tried
        // to do asynchronous work. Its eventual rejection is consumed so it
        // cannot surface a second diagnostic.
        hook.on_broken(|_| {});
        hook.dispose();
        Err(RpcError::map_misuse("map callbacks cannot be asynchronous"))
    }

    fn translate_import(&self, hook: &Hook) -> Option<Expression> {
        match hook {
            Hook::MapVariable(var) => {
                let owner = var.builder.upgrade()?;
                if std::ptr::eq(Arc::as_ptr(&owner), self) {
                    Some(Expression::Pipeline {
                        subject: var.index,
                        path: Vec::new(),
                        args: None,
                    })
                } else if self.parent.is_some() {
                    self.capture(hook).ok().map(capture_reference)
                } else {
                    None
                }
            }
            // Remote capabilities embedded in arguments or the output are
            // captured like any other enclosing-scope hook.
            Hook::Import(_) => self.capture(hook).ok().map(capture_reference),
            _ => {
                let inner = self.inner.lock().ok()?;
                inner
                    .capture_map
                    .get(&hook.identity())
                    .map(|index| capture_reference(*index))
            }
        }
    }
}

impl MapBuilder {
    pub(crate) fn root() -> Self {
        MapBuilder {
            shared: BuilderShared::new(None),
        }
    }

    /// The placeholder standing for the map input (variable 0).
    pub fn input(&self) -> MapVariable {
        MapVariable::new(Arc::downgrade(&self.shared), 0)
    }

    /// Record a property access on a subject from the enclosing scope (or a
    /// placeholder).
    pub fn get(&self, subject: &Hook, path: &[PropertyKey]) -> Result<MapVariable, RpcError> {
        let index = self.shared.capture(subject)?;
        self.shared.push_get(index, path.to_vec())
    }

    /// Record a method call on a subject from the enclosing scope (or a
    /// placeholder). Arguments may contain placeholders via
    /// [`MapVariable::into_value`].
    pub fn call(
        &self,
        subject: &Hook,
        path: &[PropertyKey],
        args: Vec<Value>,
    ) -> Result<MapVariable, RpcError> {
        let index = match self.shared.capture(subject) {
            Ok(index) => index,
            Err(err) => {
                for arg in args {
                    arg.dispose();
                }
                return Err(err);
            }
        };
        self.shared.push_call(index, path.to_vec(), args)
    }

    /// Record a nested map over a subject; the child callback records into
    /// its own scope and the whole recording lands as one instruction here.
    pub fn map<F>(
        &self,
        subject: &Hook,
        path: &[PropertyKey],
        f: F,
    ) -> Result<MapVariable, RpcError>
    where
        F: FnOnce(&MapBuilder, MapVariable) -> Result<Value, RpcError>,
    {
        let subject_index = self.shared.capture(subject)?;
        let child = MapBuilder {
            shared: BuilderShared::new(Some(self.shared.clone())),
        };
        let input = child.input();
        let value = match f(&child, input) {
            Ok(value) => value,
            Err(err) => {
                child.shared.abandon();
                return Err(err);
            }
        };
        child.shared.finish(value)?;
        let (captures, instructions) = child.shared.take_recording()?;
        let capture_refs: Vec<CaptureRef> = captures
            .into_iter()
            .map(|captured| match captured {
                Captured::ParentIndex(index) => CaptureRef::Import(index),
                Captured::Hook(hook) => {
                    // Nested builders only ever store parent indices.
                    hook.dispose();
                    CaptureRef::Import(0)
                }
            })
            .collect();

        let mut inner = self.shared.lock()?;
        BuilderShared::check_open(&inner)?;
        inner.instructions.push(Expression::Remap {
            subject: subject_index,
            path: path.to_vec(),
            captures: capture_refs,
            instructions,
        });
        let index = inner.next_variable;
        inner.next_variable += 1;
        Ok(MapVariable::new(Arc::downgrade(&self.shared), index))
    }

    fn finish(self, value: Value) -> Result<(Vec<Hook>, Vec<Expression>), RpcError> {
        self.shared.finish(value)?;
        let (captures, instructions) = self.shared.take_recording()?;
        let hooks = captures
            .into_iter()
            .filter_map(|captured| match captured {
                Captured::Hook(hook) => Some(hook),
                Captured::ParentIndex(_) => None,
            })
            .collect();
        Ok((hooks, instructions))
    }
}

impl std::fmt::Debug for MapBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapBuilder").finish()
    }
}

impl MapVariable {
    /// Record a property access on this placeholder.
    pub fn get_path(&self, path: &[PropertyKey]) -> Result<MapVariable, RpcError> {
        let builder = self
            .builder
            .upgrade()
            .ok_or_else(|| RpcError::map_misuse("abstract placeholder used outside map"))?;
        builder.push_get(self.index, path.to_vec())
    }

    /// Record a method call on this placeholder.
    pub fn call_path(&self, path: &[PropertyKey], args: Vec<Value>) -> Result<MapVariable, RpcError> {
        let builder = match self.builder.upgrade() {
            Some(builder) => builder,
            None => {
                for arg in args {
                    arg.dispose();
                }
                return Err(RpcError::map_misuse(
                    "abstract placeholder used outside map",
                ));
            }
        };
        builder.push_call(self.index, path.to_vec(), args)
    }
}

impl Hook {
    /// Record `f` against a placeholder and install the recording as a map
    /// over the value at `path`. The callback runs exactly once, locally
    /// and synchronously; the recording is replayed per element at the
    /// data's home.
    pub fn map<F>(&self, path: &[PropertyKey], f: F) -> Result<Hook, RpcError>
    where
        F: FnOnce(&MapBuilder, MapVariable) -> Result<Value, RpcError>,
    {
        let builder = MapBuilder::root();
        let input = builder.input();
        let value = match f(&builder, input) {
            Ok(value) => value,
            Err(err) => {
                builder.shared.abandon();
                return Err(err);
            }
        };
        let (captures, instructions) = builder.finish(value)?;
        self.map_recorded(path, captures, instructions)
    }
}
