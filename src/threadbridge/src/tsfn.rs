//! Threadsafe functions: a bounded FIFO that lets any thread queue calls into
//! a function living on one environment's thread.
//!
//! Producers push data from any thread with [`ThreadsafeFunction::call`].
//! The owner loop drains the queue in dispatch passes of at most
//! `dispatch_batch_size` items. Only one pass runs at a time; requests made
//! while a pass is running are folded into it through the dispatch state bits.
//!
//! A function stays open while its thread count is non-zero. Releasing the
//! last thread, or releasing with [`ReleaseMode::Abort`], closes it: the
//! finalizer runs exactly once on the owner thread, then any data still queued
//! is handed to `call_js` without an environment so it can be freed.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use threadbridge_common::layout::tsfn as layout;
use tracing::{Level, instrument};

use crate::context::LoopHandle;
use crate::env::{Env, HandleId, RefId};
use crate::metrics::MetricsGuard;
use crate::threads::MessageType;
use crate::{Error, Result};

/// Data queued by a producer.
pub type Data = Box<dyn Any + Send>;

/// Called on the owner thread for each queued item.
///
/// During the final drain the environment and function are `None` and the
/// callback only has to release `data`.
pub type CallJs = Box<dyn FnMut(Option<&Env>, Option<HandleId>, Data)>;

/// Called once on the owner thread when the function closes.
pub type TsfnFinalize = Box<dyn FnOnce(&Env, Option<Arc<dyn Any + Send + Sync>>)>;

/// How [`ThreadsafeFunction::call`] behaves when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Wait for room.
    Blocking,
    /// Fail with [`Error::QueueFull`].
    NonBlocking,
}

/// How [`ThreadsafeFunction::release`] gives up its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Close once every thread has released.
    Release,
    /// Close now. Further calls fail with [`Error::Closing`].
    Abort,
}

/// Options for [`Env::create_threadsafe_function`].
#[derive(Clone)]
pub struct ThreadsafeFunctionOptions {
    /// Queue capacity, `0` for unbounded.
    pub max_queue_size: usize,
    /// Threads using the function at creation, at least one.
    pub initial_thread_count: usize,
    /// Name reported in diagnostics.
    pub resource_name: String,
    /// Data shared by every call, handed to the finalizer.
    pub context: Option<Arc<dyn Any + Send + Sync>>,
}

impl Default for ThreadsafeFunctionOptions {
    fn default() -> Self {
        Self {
            max_queue_size: 0,
            initial_thread_count: 1,
            resource_name: "threadsafe_function".to_string(),
            context: None,
        }
    }
}

impl std::fmt::Debug for ThreadsafeFunctionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadsafeFunctionOptions")
            .field("max_queue_size", &self.max_queue_size)
            .field("initial_thread_count", &self.initial_thread_count)
            .field("resource_name", &self.resource_name)
            .field("context", &self.context.is_some())
            .finish()
    }
}

struct TsfnState {
    queue: VecDeque<Data>,
    thread_count: usize,
    is_closing: bool,
    handles_closing: bool,
}

pub(crate) struct TsfnShared {
    id: u64,
    env_id: u32,
    state: Mutex<TsfnState>,
    cond: Condvar,
    dispatch_state: AtomicU8,
    max_queue_size: usize,
    owner: LoopHandle,
    context: Option<Arc<dyn Any + Send + Sync>>,
    refed: AtomicBool,
    async_id: u64,
    trigger_async_id: u64,
    resource_name: String,
    _metric_guard: MetricsGuard<TsfnShared>,
}

impl TsfnShared {
    fn lock(&self) -> MutexGuard<'_, TsfnState> {
        // producers never panic while holding the lock
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owner-thread half of a threadsafe function, kept by its environment.
pub(crate) struct TsfnLocal {
    shared: Arc<TsfnShared>,
    func: Option<RefId>,
    call_js: Option<Rc<RefCell<CallJs>>>,
    finalize: Option<TsfnFinalize>,
}

/// A sendable handle to a threadsafe function.
#[derive(Clone)]
pub struct ThreadsafeFunction {
    shared: Arc<TsfnShared>,
}

impl std::fmt::Debug for ThreadsafeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadsafeFunction")
            .field("id", &self.shared.id)
            .field("env", &self.shared.env_id)
            .field("resource_name", &self.shared.resource_name)
            .finish()
    }
}

/// Point-in-time view of a threadsafe function's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsfnSnapshot {
    /// Threads still using the function.
    pub thread_count: u32,
    /// Whether it is closing.
    pub is_closing: bool,
    /// Whether the final drain has been scheduled.
    pub handles_closing: bool,
    /// Dispatch state bits.
    pub dispatch_state: u8,
    /// Queue capacity, `0` for unbounded.
    pub max_queue_size: u32,
    /// Items waiting.
    pub queue_len: u32,
    /// Async id.
    pub async_id: u64,
    /// Async id of the creating resource.
    pub trigger_async_id: u64,
    /// Owning environment.
    pub env_id: u32,
}

impl TsfnSnapshot {
    /// Encode into the fixed little-endian record.
    pub fn encode(&self) -> [u8; layout::SIZE] {
        let mut out = [0u8; layout::SIZE];
        let mut put32 = |at: usize, v: u32| out[at..at + 4].copy_from_slice(&v.to_le_bytes());
        put32(layout::THREAD_COUNT_OFFSET, self.thread_count);
        put32(layout::IS_CLOSING_OFFSET, u32::from(self.is_closing));
        put32(layout::HANDLES_CLOSING_OFFSET, u32::from(self.handles_closing));
        put32(layout::DISPATCH_STATE_OFFSET, u32::from(self.dispatch_state));
        put32(layout::MAX_QUEUE_SIZE_OFFSET, self.max_queue_size);
        put32(layout::QUEUE_LEN_OFFSET, self.queue_len);
        put32(layout::ENV_ID_OFFSET, self.env_id);
        out[layout::ASYNC_ID_OFFSET..layout::ASYNC_ID_OFFSET + 8]
            .copy_from_slice(&self.async_id.to_le_bytes());
        out[layout::TRIGGER_ASYNC_ID_OFFSET..layout::TRIGGER_ASYNC_ID_OFFSET + 8]
            .copy_from_slice(&self.trigger_async_id.to_le_bytes());
        out
    }
}

fn clamp_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl ThreadsafeFunction {
    /// Queue `data` for the owner thread.
    #[instrument(err(Debug), skip_all, level=Level::TRACE)]
    pub fn call(&self, data: Data, mode: CallMode) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.lock();
        while shared.max_queue_size > 0
            && state.queue.len() >= shared.max_queue_size
            && !state.is_closing
        {
            match mode {
                CallMode::NonBlocking => return Err(Error::QueueFull),
                CallMode::Blocking if shared.owner.is_owner_thread() => {
                    return Err(Error::WouldDeadlock);
                }
                CallMode::Blocking => {
                    state = shared
                        .cond
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        if state.is_closing {
            if state.thread_count == 0 {
                return Err(Error::invalid_arg("threadsafe function has no threads left"));
            }
            state.thread_count -= 1;
            return Err(Error::Closing);
        }
        state.queue.push_back(data);
        drop(state);
        self.send();
        Ok(())
    }

    /// Register one more thread using the function.
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.is_closing {
            return Err(Error::Closing);
        }
        state.thread_count += 1;
        Ok(())
    }

    /// Give up one thread. The function closes when the last thread releases
    /// or on [`ReleaseMode::Abort`].
    #[instrument(err(Debug), skip_all, level=Level::TRACE)]
    pub fn release(&self, mode: ReleaseMode) -> Result<()> {
        let mut state = self.shared.lock();
        if state.thread_count == 0 {
            return Err(Error::invalid_arg("threadsafe function has no threads left"));
        }
        state.thread_count -= 1;
        if (state.thread_count == 0 || mode == ReleaseMode::Abort) && !state.is_closing {
            state.is_closing = mode == ReleaseMode::Abort;
            if state.is_closing && self.shared.max_queue_size > 0 {
                self.shared.cond.notify_all();
            }
            drop(state);
            self.send();
        }
        Ok(())
    }

    /// Keep the owner loop alive while the function is open.
    pub fn ref_loop(&self) {
        if !self.shared.refed.swap(true, Ordering::SeqCst) {
            self.shared.owner.ref_loop();
        }
    }

    /// Let the owner loop exit even though the function is open.
    pub fn unref_loop(&self) {
        if self.shared.refed.swap(false, Ordering::SeqCst) {
            self.shared.owner.unref_loop();
        }
    }

    /// The context given at creation.
    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.context.clone()
    }

    /// Id within the owning environment.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current bookkeeping.
    pub fn snapshot(&self) -> TsfnSnapshot {
        let state = self.shared.lock();
        TsfnSnapshot {
            thread_count: clamp_u32(state.thread_count),
            is_closing: state.is_closing,
            handles_closing: state.handles_closing,
            dispatch_state: self.shared.dispatch_state.load(Ordering::SeqCst),
            max_queue_size: clamp_u32(self.shared.max_queue_size),
            queue_len: clamp_u32(state.queue.len()),
            async_id: self.shared.async_id,
            trigger_async_id: self.shared.trigger_async_id,
            env_id: self.shared.env_id,
        }
    }

    /// Request a dispatch pass on the owner loop.
    fn send(&self) {
        send(&self.shared);
    }
}

fn send(shared: &Arc<TsfnShared>) {
    let previous = shared
        .dispatch_state
        .fetch_or(layout::DISPATCH_PENDING, Ordering::SeqCst);
    if previous & (layout::DISPATCH_RUNNING | layout::DISPATCH_PENDING) != 0 {
        return;
    }
    let target = shared.clone();
    let posted = shared.owner.post(MessageType::TsfnSend, move |ctx| {
        match ctx.env(target.env_id) {
            Some(env) => dispatch(&env, &target),
            None => tracing::debug!(tsfn = target.id, "Environment gone, dropping dispatch"),
        }
    });
    if posted.is_err() {
        shared
            .dispatch_state
            .fetch_and(!layout::DISPATCH_PENDING, Ordering::SeqCst);
        tracing::warn!(tsfn = shared.id, "Owner loop closed, dispatch dropped");
    }
}

#[instrument(skip_all, level=Level::TRACE)]
fn dispatch(env: &Env, shared: &Arc<TsfnShared>) {
    let mut has_more = true;
    let mut iterations_left = env.dispatch_batch_size();
    while has_more && iterations_left > 0 {
        iterations_left -= 1;
        shared
            .dispatch_state
            .store(layout::DISPATCH_RUNNING, Ordering::SeqCst);
        has_more = dispatch_one(env, shared);
        if shared
            .dispatch_state
            .swap(layout::DISPATCH_IDLE, Ordering::SeqCst)
            != layout::DISPATCH_RUNNING
        {
            has_more = true;
        }
    }
    if has_more {
        send(shared);
    }
}

// Pops at most one item and delivers it. Returns whether more items remain.
fn dispatch_one(env: &Env, shared: &Arc<TsfnShared>) -> bool {
    let mut data = None;
    let mut has_more = false;
    let mut close = false;
    {
        let mut state = shared.lock();
        if state.is_closing {
            close = begin_close(shared, &mut state);
        } else {
            let mut size = state.queue.len();
            if size > 0 {
                data = state.queue.pop_front();
                if size == shared.max_queue_size && shared.max_queue_size > 0 {
                    shared.cond.notify_one();
                }
                size -= 1;
            }
            if size == 0 {
                if state.thread_count == 0 {
                    state.is_closing = true;
                    if shared.max_queue_size > 0 {
                        shared.cond.notify_all();
                    }
                    close = begin_close(shared, &mut state);
                }
            } else {
                has_more = true;
            }
        }
    }

    if let Some(data) = data {
        call_js(env, shared, data);
    }
    if close {
        finalize(env, shared.id);
        return false;
    }
    has_more
}

fn call_js(env: &Env, shared: &TsfnShared, data: Data) {
    let local = env.with_state(|st| {
        st.tsfns
            .get(&shared.id)
            .map(|local| (local.func, local.call_js.clone()))
    });
    let Some((func, call_js)) = local else {
        return;
    };
    #[cfg(feature = "function_call_metrics")]
    let _metric_guard = crate::metrics::CallbackMetricGuard::new("threadsafe_function");
    env.invoke_from_loop(|env| {
        env.with_handle_scope(|env| {
            let func = match func {
                Some(id) => env.get_reference_value(id).ok().flatten(),
                None => None,
            };
            match call_js {
                Some(call_js) => (call_js.borrow_mut())(Some(env), func, data),
                None => {
                    if let Some(func) = func {
                        // the exception, if any, stays pending for the loop
                        let _ = env.call_function(HandleId::UNDEFINED, func, &[]);
                    }
                }
            }
        })
    });
}

// Marks the handles closing. Returns whether the caller should finalize.
fn begin_close(shared: &TsfnShared, state: &mut TsfnState) -> bool {
    if state.handles_closing {
        return false;
    }
    state.handles_closing = true;
    tracing::debug!(tsfn = shared.id, "Closing threadsafe function");
    true
}

#[instrument(skip_all, level=Level::DEBUG)]
fn finalize(env: &Env, id: u64) {
    let Some(local) = env.with_state(|st| st.tsfns.remove(&id)) else {
        return;
    };
    let TsfnLocal {
        shared,
        func,
        call_js,
        finalize,
    } = local;

    if let Some(finalize) = finalize {
        let context = shared.context.clone();
        env.invoke_from_loop(|env| env.with_handle_scope(|env| finalize(env, context)));
    }

    let remaining: Vec<Data> = shared.lock().queue.drain(..).collect();
    for data in remaining {
        match &call_js {
            Some(call_js) => (call_js.borrow_mut())(None, None, data),
            None => drop(data),
        }
    }

    if let Some(func) = func
        && let Err(e) = env.delete_reference(func)
    {
        tracing::debug!(tsfn = id, error = %e, "Function reference already gone");
    }
    // absent when teardown already popped the hook
    let _ = env.remove_env_cleanup_hook(tsfn_cleanup_hook, id as usize);
    if shared.refed.swap(false, Ordering::SeqCst) {
        shared.owner.unref_loop();
    }
    env.unref_env();
}

fn tsfn_cleanup_hook(env: &Env, id: usize) {
    let id = id as u64;
    let shared = env.with_state(|st| st.tsfns.get(&id).map(|local| local.shared.clone()));
    let Some(shared) = shared else {
        return;
    };
    let close = {
        let mut state = shared.lock();
        state.is_closing = true;
        if shared.max_queue_size > 0 {
            shared.cond.notify_all();
        }
        begin_close(&shared, &mut state)
    };
    if close {
        finalize(env, id);
    }
}

impl Env {
    /// Create a threadsafe function.
    ///
    /// Without `call_js`, each queued item calls `func` with no arguments.
    #[instrument(err(Debug), skip_all, level=Level::DEBUG)]
    pub fn create_threadsafe_function(
        &self,
        func: Option<HandleId>,
        options: ThreadsafeFunctionOptions,
        call_js: Option<CallJs>,
        finalize: Option<TsfnFinalize>,
    ) -> Result<ThreadsafeFunction> {
        if options.initial_thread_count == 0 {
            return Err(Error::invalid_arg("initial_thread_count must be positive"));
        }
        if func.is_none() && call_js.is_none() {
            return Err(Error::invalid_arg("a function or call_js is required"));
        }
        let func = match func {
            Some(handle) => {
                if self.typeof_value(handle)? != crate::env::ValueType::Function {
                    return Err(Error::FunctionExpected);
                }
                Some(self.create_reference(handle, 1)?)
            }
            None => None,
        };
        let ctx = self.context().ok_or(Error::LoopClosed)?;
        let id = self.with_state(|st| st.next_id());
        let async_id = ctx.next_async_id();
        let shared = Arc::new(TsfnShared {
            id,
            env_id: self.id(),
            state: Mutex::new(TsfnState {
                queue: VecDeque::new(),
                thread_count: options.initial_thread_count,
                is_closing: false,
                handles_closing: false,
            }),
            cond: Condvar::new(),
            dispatch_state: AtomicU8::new(layout::DISPATCH_IDLE),
            max_queue_size: options.max_queue_size,
            owner: self.loop_handle().clone(),
            context: options.context,
            refed: AtomicBool::new(true),
            async_id,
            trigger_async_id: 0,
            resource_name: options.resource_name,
            _metric_guard: MetricsGuard::new(),
        });
        self.add_env_cleanup_hook(tsfn_cleanup_hook, id as usize)?;
        self.with_state(|st| {
            st.tsfns.insert(
                id,
                TsfnLocal {
                    shared: shared.clone(),
                    func,
                    call_js: call_js.map(|c| Rc::new(RefCell::new(c))),
                    finalize,
                },
            )
        });
        self.ref_env();
        shared.owner.ref_loop();
        tracing::debug!(
            tsfn = id,
            env = self.id(),
            resource = %shared.resource_name,
            "Created threadsafe function"
        );
        Ok(ThreadsafeFunction { shared })
    }

    /// Open threadsafe functions on this environment.
    pub fn threadsafe_function_count(&self) -> usize {
        self.with_state(|st| st.tsfns.len())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::context::Context;

    fn setup() -> (Context, Env) {
        let ctx = Context::new(Arc::new(RuntimeConfig::default())).unwrap();
        let env = ctx.create_env();
        (ctx, env)
    }

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, CallJs) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let call_js: CallJs = Box::new(move |env, _, data| {
            if env.is_some()
                && let Ok(n) = data.downcast::<u32>()
            {
                sink.borrow_mut().push(*n);
            }
        });
        (seen, call_js)
    }

    #[test]
    fn calls_are_delivered_in_order() {
        let (ctx, env) = setup();
        let (seen, call_js) = recorder();
        let tsfn = env
            .create_threadsafe_function(None, Default::default(), Some(call_js), None)
            .unwrap();
        for i in 0..5u32 {
            tsfn.call(Box::new(i), CallMode::NonBlocking).unwrap();
        }
        ctx.run_until_idle();
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
        assert_eq!(tsfn.snapshot().dispatch_state, layout::DISPATCH_IDLE);
    }

    #[test]
    fn full_queue_rejects_non_blocking_and_blocking_on_owner() {
        let (_ctx, env) = setup();
        let (_seen, call_js) = recorder();
        let options = ThreadsafeFunctionOptions {
            max_queue_size: 1,
            ..Default::default()
        };
        let tsfn = env
            .create_threadsafe_function(None, options, Some(call_js), None)
            .unwrap();
        tsfn.call(Box::new(1u32), CallMode::NonBlocking).unwrap();
        assert!(matches!(
            tsfn.call(Box::new(2u32), CallMode::NonBlocking),
            Err(Error::QueueFull)
        ));
        assert!(matches!(
            tsfn.call(Box::new(3u32), CallMode::Blocking),
            Err(Error::WouldDeadlock)
        ));
    }

    #[test]
    fn blocking_producer_waits_for_room() {
        let (ctx, env) = setup();
        let (seen, call_js) = recorder();
        let options = ThreadsafeFunctionOptions {
            max_queue_size: 1,
            ..Default::default()
        };
        let tsfn = env
            .create_threadsafe_function(None, options, Some(call_js), None)
            .unwrap();
        let producer = tsfn.clone();
        tsfn.acquire().unwrap();
        let worker = std::thread::spawn(move || {
            for i in 0..3u32 {
                producer.call(Box::new(i), CallMode::Blocking).unwrap();
            }
            producer.release(ReleaseMode::Release).unwrap();
        });
        assert!(ctx.run_until(|| seen.borrow().len() == 3, Some(Duration::from_secs(5))));
        worker.join().unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn release_of_last_thread_finalizes_once() {
        let (ctx, env) = setup();
        let finalized = Rc::new(Cell::new(0));
        let count = finalized.clone();
        let (seen, call_js) = recorder();
        let tsfn = env
            .create_threadsafe_function(
                None,
                Default::default(),
                Some(call_js),
                Some(Box::new(move |_, _| count.set(count.get() + 1))),
            )
            .unwrap();
        assert_eq!(env.refcount(), 2);
        tsfn.call(Box::new(9u32), CallMode::NonBlocking).unwrap();
        tsfn.release(ReleaseMode::Release).unwrap();
        ctx.run_until_idle();
        assert_eq!(*seen.borrow(), vec![9]);
        assert_eq!(finalized.get(), 1);
        assert_eq!(env.refcount(), 1);
        assert_eq!(env.threadsafe_function_count(), 0);
        assert_eq!(ctx.loop_handle().active_refs(), 0);
        assert!(tsfn.release(ReleaseMode::Release).is_err());
    }

    #[test]
    fn abort_hands_queued_items_to_final_drain() {
        let (ctx, env) = setup();
        let drained = Rc::new(Cell::new(0));
        let delivered = Rc::new(Cell::new(0));
        let (d, l) = (drained.clone(), delivered.clone());
        let call_js: CallJs = Box::new(move |env, _, _data| {
            if env.is_some() {
                l.set(l.get() + 1);
            } else {
                d.set(d.get() + 1);
            }
        });
        let tsfn = env
            .create_threadsafe_function(None, Default::default(), Some(call_js), None)
            .unwrap();
        tsfn.acquire().unwrap();
        tsfn.call(Box::new(1u32), CallMode::NonBlocking).unwrap();
        tsfn.call(Box::new(2u32), CallMode::NonBlocking).unwrap();
        tsfn.release(ReleaseMode::Abort).unwrap();
        assert!(matches!(
            tsfn.call(Box::new(3u32), CallMode::NonBlocking),
            Err(Error::Closing)
        ));
        assert!(matches!(tsfn.acquire(), Err(Error::Closing)));
        ctx.run_until_idle();
        assert_eq!(delivered.get(), 0);
        assert_eq!(drained.get(), 2);
    }

    #[test]
    fn teardown_closes_open_functions() {
        let (ctx, env) = setup();
        let finalized = Rc::new(Cell::new(false));
        let flag = finalized.clone();
        let (_seen, call_js) = recorder();
        let _tsfn = env
            .create_threadsafe_function(
                None,
                Default::default(),
                Some(call_js),
                Some(Box::new(move |_, _| flag.set(true))),
            )
            .unwrap();
        ctx.teardown();
        assert!(finalized.get());
        assert!(env.is_disposed());
    }

    #[test]
    fn default_call_js_invokes_function() {
        let (ctx, env) = setup();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let func = env.create_function("tick", move |_, _| {
            counter.set(counter.get() + 1);
            Ok(crate::env::Value::Undefined)
        });
        let tsfn = env
            .create_threadsafe_function(Some(func), Default::default(), None, None)
            .unwrap();
        tsfn.call(Box::new(()), CallMode::NonBlocking).unwrap();
        tsfn.call(Box::new(()), CallMode::NonBlocking).unwrap();
        ctx.run_until_idle();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn snapshot_encodes_fixed_layout() {
        let (_ctx, env) = setup();
        let options = ThreadsafeFunctionOptions {
            max_queue_size: 8,
            initial_thread_count: 3,
            ..Default::default()
        };
        let (_seen, call_js) = recorder();
        let tsfn = env
            .create_threadsafe_function(None, options, Some(call_js), None)
            .unwrap();
        tsfn.call(Box::new(1u32), CallMode::NonBlocking).unwrap();
        let bytes = tsfn.snapshot().encode();
        let word = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(word(layout::THREAD_COUNT_OFFSET), 3);
        assert_eq!(word(layout::MAX_QUEUE_SIZE_OFFSET), 8);
        assert_eq!(word(layout::QUEUE_LEN_OFFSET), 1);
        assert_eq!(word(layout::ENV_ID_OFFSET), env.id());
        assert_eq!(
            word(layout::DISPATCH_STATE_OFFSET),
            u32::from(layout::DISPATCH_PENDING)
        );
    }

    #[test]
    fn creation_requires_threads_and_a_callee() {
        let (_ctx, env) = setup();
        let options = ThreadsafeFunctionOptions {
            initial_thread_count: 0,
            ..Default::default()
        };
        let (_seen, call_js) = recorder();
        assert!(
            env.create_threadsafe_function(None, options, Some(call_js), None)
                .is_err()
        );
        assert!(
            env.create_threadsafe_function(None, Default::default(), None, None)
                .is_err()
        );
    }
}
