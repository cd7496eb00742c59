//! Environments: the per-module state that native code talks to.
//!
//! An [`Env`] owns a handle table with its scope stack, a reference arena,
//! cleanup hooks, instance data and the owner-thread halves of threadsafe
//! functions and async work. It lives on exactly one thread; every value it
//! hands out is an integer [`HandleId`] valid until the enclosing scope
//! closes.
//!
//! # Finalization
//!
//! Values are reference counted. A [`JsObject`] that is only weakly
//! referenced is collected as soon as its last strong holder goes away, and
//! its drop hooks queue the finalizers of the references watching it. The
//! queue is drained from the event loop, never from inside the drop, so
//! finalizers always run with a clean call stack.
//!
//! # Lifecycle
//!
//! The refcount starts at one. Threadsafe functions hold an extra count until
//! they are finalized. When the count reaches zero the env finalizes
//! `finalizing` references newest first, releases the rest, drains queued
//! finalizers, runs cleanup hooks in reverse registration order, finalizes
//! instance data and removes itself from its [`Context`]. Disposal runs once.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use tracing::{Level, instrument};

use crate::async_work::WorkRecord;
use crate::config::Capabilities;
use crate::context::{Context, ContextInner, LoopHandle};
use crate::metrics::MetricsGuard;
use crate::threads::MessageType;
use crate::tsfn::TsfnLocal;
use crate::{Error, Exception, Result};

mod cleanup;
mod handle_scope;
mod reference;
mod value;

pub use cleanup::CleanupHook;
use cleanup::CleanupQueue;
pub use handle_scope::{HandleId, ScopeId};
use handle_scope::{HandleStore, ScopeStore};
pub use reference::{FinalizeCallback, Ownership, RefId};
use reference::{Persistent, RefArena, Reference};
pub use value::{FunctionBody, JsObject, Value, ValueType, WeakObject};
use value::Wrapped;

type UncaughtHandler = Rc<dyn Fn(&Env, &Exception)>;

pub(crate) struct EnvState {
    handles: HandleStore,
    scopes: ScopeStore,
    refs: RefArena,
    cleanup: CleanupQueue,
    pending_exception: Option<Exception>,
    last_uncaught: Option<Exception>,
    instance_data: Option<(Rc<dyn Any>, Option<FinalizeCallback>)>,
    pub(crate) tsfns: HashMap<u64, TsfnLocal>,
    pub(crate) works: HashMap<u64, WorkRecord>,
    next_id: u64,
}

impl EnvState {
    fn new() -> Self {
        Self {
            handles: HandleStore::new(),
            scopes: ScopeStore::new(),
            refs: RefArena::new(),
            cleanup: CleanupQueue::default(),
            pending_exception: None,
            last_uncaught: None,
            instance_data: None,
            tsfns: HashMap::new(),
            works: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push(&mut self, value: Value) -> HandleId {
        let id = self.handles.push(value);
        self.scopes.track(&self.handles);
        id
    }
}

/// Queue of references whose values were released, shared with drop hooks.
#[derive(Clone)]
struct FinalizerQueue {
    pending: Rc<RefCell<VecDeque<RefId>>>,
    scheduled: Rc<Cell<bool>>,
    handle: LoopHandle,
    env: u32,
}

impl FinalizerQueue {
    fn enqueue(&self, id: RefId) {
        self.pending.borrow_mut().push_back(id);
        if self.scheduled.replace(true) {
            return;
        }
        let env = self.env;
        let posted = self.handle.post(MessageType::AsyncSend, move |ctx| {
            if let Some(env) = ctx.env(env) {
                env.drain_pending_finalizers();
            }
        });
        if posted.is_err() {
            self.scheduled.set(false);
            tracing::debug!(env, "Event loop closed, finalizers stay queued");
        }
    }

    fn pop(&self) -> Option<RefId> {
        self.pending.borrow_mut().pop_front()
    }
}

pub(crate) struct EnvInner {
    id: u32,
    ctx: Weak<ContextInner>,
    loop_handle: LoopHandle,
    caps: Capabilities,
    abort_on_fatal: bool,
    dispatch_batch_size: usize,
    state: RefCell<EnvState>,
    finalizers: FinalizerQueue,
    refcount: Cell<usize>,
    disposed: Cell<bool>,
    poisoned: Cell<bool>,
    tearing_down: Cell<bool>,
    uncaught_handler: RefCell<Option<UncaughtHandler>>,
    _metric_guard: MetricsGuard<EnvInner>,
}

/// A module environment bound to one thread.
#[derive(Clone)]
pub struct Env {
    inner: Rc<EnvInner>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.inner.id)
            .field("refcount", &self.inner.refcount.get())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

impl Env {
    pub(crate) fn new(ctx: &Context, id: u32) -> Self {
        let config = ctx.config();
        let loop_handle = ctx.loop_handle();
        Self {
            inner: Rc::new(EnvInner {
                id,
                ctx: ctx.downgrade(),
                finalizers: FinalizerQueue {
                    pending: Rc::new(RefCell::new(VecDeque::new())),
                    scheduled: Rc::new(Cell::new(false)),
                    handle: loop_handle.clone(),
                    env: id,
                },
                loop_handle,
                caps: config.capabilities,
                abort_on_fatal: config.abort_on_fatal,
                dispatch_batch_size: config.dispatch_batch_size,
                state: RefCell::new(EnvState::new()),
                refcount: Cell::new(1),
                disposed: Cell::new(false),
                poisoned: Cell::new(false),
                tearing_down: Cell::new(false),
                uncaught_handler: RefCell::new(None),
                _metric_guard: MetricsGuard::new(),
            }),
        }
    }

    /// Id of the environment within its context.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// The context this environment lives on, while it exists.
    pub fn context(&self) -> Option<Context> {
        Context::upgrade(&self.inner.ctx)
    }

    pub(crate) fn loop_handle(&self) -> &LoopHandle {
        &self.inner.loop_handle
    }

    pub(crate) fn dispatch_batch_size(&self) -> usize {
        self.inner.dispatch_batch_size
    }

    /// Borrow the mutable state. `f` must not call back into the env.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut EnvState) -> R) -> R {
        f(&mut self.inner.state.borrow_mut())
    }

    // ----- values -----

    /// Bind `value` to a handle in the current scope.
    pub fn new_handle(&self, value: Value) -> HandleId {
        self.with_state(|st| st.push(value))
    }

    /// The value behind a handle.
    pub fn get_value(&self, handle: HandleId) -> Result<Value> {
        self.with_state(|st| st.handles.get(handle))
    }

    fn get_object(&self, handle: HandleId) -> Result<JsObject> {
        match self.get_value(handle)? {
            Value::Object(o) => Ok(o),
            _ => Err(Error::ObjectExpected),
        }
    }

    /// `undefined`.
    pub fn get_undefined(&self) -> HandleId {
        HandleId::UNDEFINED
    }

    /// `null`.
    pub fn get_null(&self) -> HandleId {
        HandleId::NULL
    }

    /// `true` or `false`.
    pub fn get_boolean(&self, value: bool) -> HandleId {
        if value {
            HandleId::TRUE
        } else {
            HandleId::FALSE
        }
    }

    /// The global object.
    pub fn get_global(&self) -> HandleId {
        HandleId::GLOBAL
    }

    /// A number from an `i32`.
    pub fn create_int32(&self, value: i32) -> HandleId {
        self.new_handle(Value::Number(f64::from(value)))
    }

    /// A number.
    pub fn create_double(&self, value: f64) -> HandleId {
        self.new_handle(Value::Number(value))
    }

    /// A string.
    pub fn create_string(&self, value: &str) -> HandleId {
        self.new_handle(Value::string(value))
    }

    /// An empty object.
    pub fn create_object(&self) -> HandleId {
        self.new_handle(Value::Object(JsObject::plain()))
    }

    /// A function backed by native code.
    pub fn create_function(
        &self,
        name: &str,
        body: impl Fn(&Env, &[Value]) -> Result<Value> + 'static,
    ) -> HandleId {
        let body: FunctionBody = Rc::new(body);
        self.new_handle(Value::Object(JsObject::function(name.to_string(), body)))
    }

    /// An opaque value carrying native data, finalized when collected.
    pub fn create_external(
        &self,
        data: impl Any,
        finalize: Option<FinalizeCallback>,
    ) -> HandleId {
        let object = JsObject::external(Box::new(data));
        if let Some(finalize) = finalize {
            self.new_reference(
                Value::Object(object.clone()),
                0,
                Ownership::Runtime,
                Some(finalize),
            );
        }
        self.new_handle(Value::Object(object))
    }

    /// `typeof`.
    pub fn typeof_value(&self, handle: HandleId) -> Result<ValueType> {
        Ok(self.get_value(handle)?.value_type())
    }

    /// The number behind a handle.
    pub fn get_value_double(&self, handle: HandleId) -> Result<f64> {
        match self.get_value(handle)? {
            Value::Number(n) => Ok(n),
            _ => Err(Error::NumberExpected),
        }
    }

    /// The number behind a handle, truncated to `i32`.
    pub fn get_value_int32(&self, handle: HandleId) -> Result<i32> {
        let n = self.get_value_double(handle)?;
        Ok(if n.is_finite() { n as i32 } else { 0 })
    }

    /// The boolean behind a handle.
    pub fn get_value_bool(&self, handle: HandleId) -> Result<bool> {
        match self.get_value(handle)? {
            Value::Boolean(b) => Ok(b),
            _ => Err(Error::BooleanExpected),
        }
    }

    /// The string behind a handle.
    pub fn get_value_string(&self, handle: HandleId) -> Result<String> {
        match self.get_value(handle)? {
            Value::String(s) => Ok(s.to_string()),
            _ => Err(Error::StringExpected),
        }
    }

    /// The data of an external.
    pub fn get_value_external(&self, handle: HandleId) -> Result<JsObject> {
        let object = self.get_object(handle)?;
        if object.value_type() != ValueType::External {
            return Err(Error::invalid_arg("value is not an external"));
        }
        Ok(object)
    }

    /// `object[name] = value`.
    pub fn set_named_property(&self, object: HandleId, name: &str, value: HandleId) -> Result<()> {
        let object = self.get_object(object)?;
        let value = self.get_value(value)?;
        // the previous value may be collected here, outside any state borrow
        drop(object.set(name, value));
        Ok(())
    }

    /// `object[name]`, `undefined` when missing.
    pub fn get_named_property(&self, object: HandleId, name: &str) -> Result<HandleId> {
        let object = self.get_object(object)?;
        Ok(self.new_handle(object.get(name).unwrap_or(Value::Undefined)))
    }

    /// Call a function value.
    ///
    /// If the function throws, the exception stays pending and the call
    /// fails with [`Error::PendingException`].
    #[instrument(err(Debug), skip_all, level=Level::TRACE)]
    pub fn call_function(
        &self,
        recv: HandleId,
        func: HandleId,
        args: &[HandleId],
    ) -> Result<HandleId> {
        if let Some(pending) = self.with_state(|st| st.pending_exception.clone()) {
            return Err(Error::PendingException(pending));
        }
        self.get_value(recv)?;
        let function = self.get_object(func).map_err(|_| Error::FunctionExpected)?;
        let (name, body) = function.function_body().ok_or(Error::FunctionExpected)?;
        tracing::trace!(function = name, argc = args.len(), "Calling function");
        let argv = args
            .iter()
            .map(|h| self.get_value(*h))
            .collect::<Result<Vec<_>>>()?;
        match body(self, &argv) {
            Ok(value) => Ok(self.new_handle(value)),
            Err(Error::PendingException(exception)) => {
                self.throw(exception.clone());
                Err(Error::PendingException(exception))
            }
            Err(err) => {
                let exception = err.to_exception();
                self.throw(exception.clone());
                Err(Error::PendingException(exception))
            }
        }
    }

    // ----- exceptions -----

    /// Make `exception` pending, replacing any pending one.
    pub fn throw(&self, exception: Exception) {
        self.with_state(|st| st.pending_exception = Some(exception));
    }

    /// Throw an `Error` with `message`.
    pub fn throw_error(&self, message: &str) {
        self.throw(Exception::new(message));
    }

    /// Whether an exception is pending.
    pub fn is_exception_pending(&self) -> bool {
        self.with_state(|st| st.pending_exception.is_some())
    }

    /// Take the pending exception.
    pub fn get_and_clear_last_exception(&self) -> Option<Exception> {
        self.with_state(|st| st.pending_exception.take())
    }

    /// Replace the handler for exceptions escaping loop callbacks.
    pub fn set_uncaught_exception_handler(&self, handler: impl Fn(&Env, &Exception) + 'static) {
        *self.inner.uncaught_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// The last exception that escaped a loop callback.
    pub fn last_uncaught_exception(&self) -> Option<Exception> {
        self.with_state(|st| st.last_uncaught.clone())
    }

    pub(crate) fn trigger_uncaught_exception(&self, exception: Exception) {
        self.with_state(|st| st.last_uncaught = Some(exception.clone()));
        let handler = self.inner.uncaught_handler.borrow().clone();
        match handler {
            Some(handler) => handler(self, &exception),
            None => tracing::error!(env = self.inner.id, %exception, "Uncaught exception"),
        }
    }

    // ----- scopes -----

    /// Open a scope. Handles created until it closes belong to it.
    pub fn open_handle_scope(&self) -> ScopeId {
        self.with_state(|st| st.scopes.open(&st.handles, false))
    }

    /// Open a scope that may promote one handle to its parent.
    pub fn open_escapable_handle_scope(&self) -> ScopeId {
        self.with_state(|st| st.scopes.open(&st.handles, true))
    }

    /// Close a scope, disposing its handles.
    pub fn close_handle_scope(&self, scope: ScopeId) -> Result<()> {
        self.with_state(|st| st.scopes.close(&mut st.handles, scope))
    }

    /// Promote `handle` out of `scope`. Allowed once per scope.
    pub fn escape_handle(&self, scope: ScopeId, handle: HandleId) -> Result<HandleId> {
        self.with_state(|st| st.scopes.escape(&mut st.handles, scope, handle))
    }

    /// Number of open scopes, not counting the root.
    pub fn open_scope_count(&self) -> usize {
        self.with_state(|st| st.scopes.depth())
    }

    /// Run `f` inside a fresh scope.
    pub fn with_handle_scope<R>(&self, f: impl FnOnce(&Env) -> R) -> R {
        let scope = self.open_handle_scope();
        let result = f(self);
        if let Err(e) = self.close_handle_scope(scope) {
            tracing::error!(env = self.inner.id, error = %e, "Failed to close handle scope");
        }
        result
    }

    // ----- calls into module code -----

    fn fatal(&self, location: &'static str, message: String) -> Error {
        self.inner.poisoned.set(true);
        tracing::error!(env = self.inner.id, location, %message, "Fatal error");
        if self.inner.abort_on_fatal {
            std::process::abort();
        }
        Error::Fatal { location, message }
    }

    /// Whether a fatal error poisoned the environment.
    pub fn is_poisoned(&self) -> bool {
        self.inner.poisoned.get()
    }

    /// Run module code, checking that it leaves the scope stack as it found it.
    pub fn call_into_module<R>(&self, f: impl FnOnce(&Env) -> R) -> Result<R> {
        if self.inner.poisoned.get() {
            return Err(Error::Poisoned);
        }
        let before = self.open_scope_count();
        let result = f(self);
        let after = self.open_scope_count();
        if before != after {
            return Err(self.fatal(
                "call_into_module",
                format!("open handle scopes changed from {before} to {after}"),
            ));
        }
        Ok(result)
    }

    /// Run a callback on behalf of the event loop. A pending exception left
    /// by `f` goes to the uncaught exception handler.
    pub(crate) fn invoke_from_loop<R>(&self, f: impl FnOnce(&Env) -> R) -> Option<R> {
        let result = match self.call_into_module(f) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(env = self.inner.id, error = %e, "Loop callback failed");
                None
            }
        };
        if let Some(exception) = self.get_and_clear_last_exception() {
            self.trigger_uncaught_exception(exception);
        }
        result
    }

    // ----- references -----

    fn new_reference(
        &self,
        value: Value,
        initial_refcount: u32,
        ownership: Ownership,
        finalizer: Option<FinalizeCallback>,
    ) -> RefId {
        let watched = value.as_object().cloned();
        let id = self.with_state(|st| {
            st.refs.insert(Reference {
                persistent: Persistent::Strong(value),
                refcount: initial_refcount,
                ownership,
                finalizer,
                seq: 0,
            })
        });
        if let Some(object) = watched
            && self.inner.caps.finalization
        {
            let queue = self.inner.finalizers.clone();
            object.on_drop(move || queue.enqueue(id));
        }
        if initial_refcount == 0 {
            self.enter_weak_mode(id);
        }
        id
    }

    fn enter_weak_mode(&self, id: RefId) {
        let weak_references = self.inner.caps.weak_references;
        let finalization = self.inner.caps.finalization;
        let (released, deterministic) = self.with_state(|st| {
            let Some(reference) = st.refs.get_mut(id) else {
                return (None, false);
            };
            let held = std::mem::replace(&mut reference.persistent, Persistent::Empty);
            match held {
                Persistent::Strong(Value::Object(object)) if weak_references => {
                    reference.persistent = Persistent::Weak(object.downgrade());
                    (Some(Value::Object(object)), false)
                }
                Persistent::Strong(value) => {
                    // watched objects report their own collection
                    let watched = value.can_be_held_weakly() && finalization;
                    let needs_finalizer = reference.finalizer.is_some() && !watched;
                    (Some(value), needs_finalizer)
                }
                other => {
                    reference.persistent = other;
                    (None, false)
                }
            }
        });
        // may collect the value and run its drop hooks
        drop(released);
        if deterministic {
            self.inner.finalizers.enqueue(id);
        }
    }

    /// Create a reference with an initial count. At zero it is weak.
    pub fn create_reference(&self, value: HandleId, initial_refcount: u32) -> Result<RefId> {
        let value = self.get_value(value)?;
        Ok(self.new_reference(value, initial_refcount, Ownership::Userland, None))
    }

    /// Create a reference whose finalizer runs once when the value is
    /// released.
    pub fn create_reference_with_finalizer(
        &self,
        value: HandleId,
        initial_refcount: u32,
        finalize: impl FnOnce(&Env) + 'static,
    ) -> Result<RefId> {
        let value = self.get_value(value)?;
        Ok(self.new_reference(
            value,
            initial_refcount,
            Ownership::Userland,
            Some(Box::new(finalize)),
        ))
    }

    /// Increment a reference, making it strong again on `0 -> 1`.
    pub fn reference_ref(&self, id: RefId) -> Result<u32> {
        self.with_state(|st| {
            let reference = st
                .refs
                .get_mut(id)
                .ok_or_else(|| Error::invalid_arg("unknown reference"))?;
            if reference.refcount == 0
                && let Persistent::Weak(weak) = &reference.persistent
                && let Some(object) = weak.upgrade()
            {
                reference.persistent = Persistent::Strong(Value::Object(object));
            }
            reference.refcount += 1;
            Ok(reference.refcount)
        })
    }

    /// Decrement a reference, making it weak on `1 -> 0`.
    pub fn reference_unref(&self, id: RefId) -> Result<u32> {
        let count = self.with_state(|st| {
            let reference = st
                .refs
                .get_mut(id)
                .ok_or_else(|| Error::invalid_arg("unknown reference"))?;
            if reference.refcount == 0 {
                return Err(Error::GenericFailure(
                    "reference count is already zero".to_string(),
                ));
            }
            reference.refcount -= 1;
            Ok(reference.refcount)
        })?;
        if count == 0 {
            self.enter_weak_mode(id);
        }
        Ok(count)
    }

    /// The current count of a reference.
    pub fn reference_count(&self, id: RefId) -> Result<u32> {
        self.with_state(|st| {
            st.refs
                .get(id)
                .map(|r| r.refcount)
                .ok_or_else(|| Error::invalid_arg("unknown reference"))
        })
    }

    /// Whether the reference no longer keeps its value alive.
    pub fn is_reference_weak(&self, id: RefId) -> Result<bool> {
        self.with_state(|st| {
            st.refs
                .get(id)
                .map(|r| !matches!(r.persistent, Persistent::Strong(_)))
                .ok_or_else(|| Error::invalid_arg("unknown reference"))
        })
    }

    /// The referenced value, or `None` once it was released.
    pub fn get_reference_value(&self, id: RefId) -> Result<Option<HandleId>> {
        let value = self.with_state(|st| {
            st.refs
                .get(id)
                .map(|r| r.persistent.value())
                .ok_or_else(|| Error::invalid_arg("unknown reference"))
        })?;
        Ok(value.map(|v| self.new_handle(v)))
    }

    /// Delete a reference.
    ///
    /// A finalizer that has not run yet runs now, whether or not the value
    /// is still alive. A drain already queued for it finds the id stale.
    pub fn delete_reference(&self, id: RefId) -> Result<()> {
        let reference = self
            .with_state(|st| st.refs.remove(id))
            .ok_or_else(|| Error::invalid_arg("unknown reference"))?;
        let Reference {
            persistent,
            finalizer,
            ..
        } = reference;
        // released before the finalizer so it observes the value gone
        drop(persistent);
        if let Some(finalize) = finalizer {
            self.run_finalizer(finalize);
        }
        Ok(())
    }

    fn run_finalizer(&self, finalize: FinalizeCallback) {
        self.invoke_from_loop(|env| env.with_handle_scope(|env| finalize(env)));
    }

    /// Run finalizers of references whose values were released.
    #[instrument(skip_all, level=Level::DEBUG)]
    pub fn drain_pending_finalizers(&self) -> usize {
        self.inner.finalizers.scheduled.set(false);
        let mut ran = 0;
        while let Some(id) = self.inner.finalizers.pop() {
            let finalize = self.with_state(|st| {
                let reference = st.refs.get_mut(id)?;
                if !reference.persistent.is_released() {
                    return None;
                }
                let finalize = reference.finalizer.take();
                if reference.ownership == Ownership::Runtime {
                    st.refs.remove(id);
                }
                finalize
            });
            if let Some(finalize) = finalize {
                self.run_finalizer(finalize);
                ran += 1;
            }
        }
        ran
    }

    /// Run `finalize` when the object is collected.
    pub fn add_finalizer(&self, object: HandleId, finalize: FinalizeCallback) -> Result<RefId> {
        let object = self.get_object(object)?;
        Ok(self.new_reference(Value::Object(object), 0, Ownership::Runtime, Some(finalize)))
    }

    /// Attach native data to an object.
    pub fn wrap(
        &self,
        object: HandleId,
        data: impl Any,
        finalize: Option<FinalizeCallback>,
    ) -> Result<()> {
        let object = self.get_object(object)?;
        if object.wrapped().is_some() {
            return Err(Error::invalid_arg("object is already wrapped"));
        }
        let reference = finalize.map(|finalize| {
            self.new_reference(
                Value::Object(object.clone()),
                0,
                Ownership::Runtime,
                Some(finalize),
            )
        });
        object.set_wrapped(Some(Wrapped {
            data: Rc::new(data),
            reference,
        }));
        Ok(())
    }

    /// The native data attached with [`wrap`](Self::wrap).
    pub fn unwrap(&self, object: HandleId) -> Result<Rc<dyn Any>> {
        self.get_object(object)?
            .wrapped()
            .map(|w| w.data)
            .ok_or_else(|| Error::invalid_arg("object is not wrapped"))
    }

    /// Detach native data without running its finalizer.
    pub fn remove_wrap(&self, object: HandleId) -> Result<Rc<dyn Any>> {
        let wrapped = self
            .get_object(object)?
            .set_wrapped(None)
            .ok_or_else(|| Error::invalid_arg("object is not wrapped"))?;
        if let Some(reference) = wrapped.reference {
            drop(self.with_state(|st| st.refs.remove(reference)));
        }
        Ok(wrapped.data)
    }

    /// Live references, for diagnostics.
    pub fn reference_len(&self) -> usize {
        self.with_state(|st| st.refs.len())
    }

    // ----- instance data -----

    /// Associate data with the environment, replacing any previous data
    /// without finalizing it.
    pub fn set_instance_data(&self, data: impl Any, finalize: Option<FinalizeCallback>) {
        let previous = self.with_state(|st| st.instance_data.replace((Rc::new(data), finalize)));
        drop(previous);
    }

    /// The data set with [`set_instance_data`](Self::set_instance_data).
    pub fn get_instance_data(&self) -> Option<Rc<dyn Any>> {
        self.with_state(|st| st.instance_data.as_ref().map(|(data, _)| data.clone()))
    }

    // ----- cleanup hooks -----

    /// Register a hook run at teardown. `(hook, arg)` must be unique.
    pub fn add_env_cleanup_hook(&self, hook: CleanupHook, arg: usize) -> Result<()> {
        self.with_state(|st| st.cleanup.add(hook, arg))
    }

    /// Unregister a cleanup hook.
    pub fn remove_env_cleanup_hook(&self, hook: CleanupHook, arg: usize) -> Result<()> {
        self.with_state(|st| st.cleanup.remove(hook, arg))
    }

    fn run_cleanup_hooks(&self) {
        loop {
            let next = self.with_state(|st| st.cleanup.pop_newest());
            let Some((hook, arg)) = next else { break };
            hook(self, arg);
        }
    }

    // ----- lifecycle -----

    /// Keep the environment alive. Returns the new count.
    pub fn ref_env(&self) -> usize {
        let count = self.inner.refcount.get() + 1;
        self.inner.refcount.set(count);
        count
    }

    /// Release one count, disposing the environment at zero.
    pub fn unref_env(&self) -> usize {
        let count = self.inner.refcount.get().saturating_sub(1);
        self.inner.refcount.set(count);
        if count == 0 {
            self.dispose();
        }
        count
    }

    /// Current refcount.
    pub fn refcount(&self) -> usize {
        self.inner.refcount.get()
    }

    /// Whether the environment has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Whether teardown or disposal has started.
    pub fn is_tearing_down(&self) -> bool {
        self.inner.tearing_down.get()
    }

    #[instrument(skip_all, level=Level::DEBUG)]
    fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        self.inner.tearing_down.set(true);

        loop {
            let finalizing = self.with_state(|st| st.refs.newest_first(true));
            if finalizing.is_empty() {
                break;
            }
            for id in finalizing {
                let finalize = self.with_state(|st| st.refs.remove(id).and_then(|r| r.finalizer));
                if let Some(finalize) = finalize {
                    self.run_finalizer(finalize);
                }
            }
        }
        for id in self.with_state(|st| st.refs.newest_first(false)) {
            drop(self.with_state(|st| st.refs.remove(id)));
        }
        self.drain_pending_finalizers();
        self.run_cleanup_hooks();

        let instance_data = self.with_state(|st| st.instance_data.take());
        if let Some((data, finalize)) = instance_data {
            if let Some(finalize) = finalize {
                self.run_finalizer(finalize);
            }
            drop(data);
        }

        let leaked = self.with_state(|st| {
            st.works
                .values()
                .filter(|work| work.is_outstanding())
                .map(|work| work.resource_name().to_string())
                .collect::<Vec<_>>()
        });
        if !leaked.is_empty() {
            tracing::warn!(
                env = self.inner.id,
                count = leaked.len(),
                resources = ?leaked,
                "Environment disposed with async work outstanding, completions will never run"
            );
        }
        let (works, tsfns) = self.with_state(|st| {
            (
                std::mem::take(&mut st.works),
                std::mem::take(&mut st.tsfns),
            )
        });
        drop((works, tsfns));

        if let Some(ctx) = self.context() {
            ctx.remove_env(self.inner.id);
        }
        tracing::debug!(env = self.inner.id, "Disposed environment");
    }

    /// Tear the environment down: run cleanup hooks, then drop the initial
    /// count. Whatever still holds a count at that point is released.
    #[instrument(skip_all, level=Level::DEBUG)]
    pub fn teardown(&self) {
        if self.inner.disposed.get() || self.inner.tearing_down.replace(true) {
            return;
        }
        self.run_cleanup_hooks();
        self.unref_env();
        if !self.inner.disposed.get() {
            tracing::warn!(
                env = self.inner.id,
                refcount = self.inner.refcount.get(),
                "Environment still referenced at teardown, disposing anyway"
            );
            self.inner.refcount.set(0);
            self.dispose();
        }
    }
}
