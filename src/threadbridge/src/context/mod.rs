//! Per-thread execution context.
//!
//! Every thread that runs module code, the main thread and each worker,
//! owns exactly one [`Context`]: a cooperative event loop, the environments
//! created on that thread and the thread's async work scheduler. A `Context`
//! is deliberately `!Send`; other threads reach it only through its
//! [`LoopHandle`].
//!
//! The loop is driven by a current-thread Tokio runtime. Tasks posted from
//! other threads arrive over an unbounded channel, while same-thread deferred
//! work goes on a local immediate queue that never leaves the thread.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime as TokioRuntime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{Level, instrument};

use crate::async_work::{AsyncWorkScheduler, new_scheduler};
use crate::config::{Capabilities, RuntimeConfig};
use crate::env::Env;
use crate::Result;

/// Sendable loop handles and task types.
pub(crate) mod event_loop;

pub use event_loop::{LoopHandle, Task};
use event_loop::{LocalTask, Posted};

pub(crate) struct ContextInner {
    rt: TokioRuntime,
    rx: RefCell<UnboundedReceiver<Posted>>,
    handle: LoopHandle,
    immediates: RefCell<VecDeque<LocalTask>>,
    envs: RefCell<BTreeMap<u32, Env>>,
    next_env_id: Cell<u32>,
    next_async_id: Cell<u64>,
    scheduler: OnceCell<Rc<dyn AsyncWorkScheduler>>,
    config: Arc<RuntimeConfig>,
    closing: Cell<bool>,
}

/// A thread's event loop together with the environments living on it.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("envs", &self.inner.envs.borrow().len())
            .field("immediates", &self.inner.immediates.borrow().len())
            .field("refs", &self.inner.handle.active_refs())
            .finish()
    }
}

impl Context {
    /// Create the context for the calling thread.
    #[instrument(err(Debug), skip_all, level=Level::DEBUG)]
    pub fn new(config: Arc<RuntimeConfig>) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (handle, rx) = LoopHandle::channel();
        Ok(Self {
            inner: Rc::new(ContextInner {
                rt,
                rx: RefCell::new(rx),
                handle,
                immediates: RefCell::new(VecDeque::new()),
                envs: RefCell::new(BTreeMap::new()),
                next_env_id: Cell::new(1),
                next_async_id: Cell::new(1),
                scheduler: OnceCell::new(),
                config,
                closing: Cell::new(false),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ContextInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// The sendable handle to this loop.
    pub fn loop_handle(&self) -> LoopHandle {
        self.inner.handle.clone()
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.inner.config
    }

    /// Host capabilities.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.config.capabilities
    }

    /// Whether [`teardown`](Self::teardown) has started.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.get()
    }

    /// Create a new environment on this thread.
    #[instrument(skip_all, level=Level::DEBUG)]
    pub fn create_env(&self) -> Env {
        let id = self.inner.next_env_id.get();
        self.inner.next_env_id.set(id.wrapping_add(1));
        let env = Env::new(self, id);
        self.inner.envs.borrow_mut().insert(id, env.clone());
        tracing::debug!(env = id, "Created environment");
        env
    }

    /// Look up a live environment.
    pub fn env(&self, id: u32) -> Option<Env> {
        self.inner.envs.borrow().get(&id).cloned()
    }

    /// Ids of the live environments, oldest first.
    pub fn env_ids(&self) -> Vec<u32> {
        self.inner.envs.borrow().keys().copied().collect()
    }

    pub(crate) fn remove_env(&self, id: u32) {
        self.inner.envs.borrow_mut().remove(&id);
    }

    pub(crate) fn next_async_id(&self) -> u64 {
        let id = self.inner.next_async_id.get();
        self.inner.next_async_id.set(id + 1);
        id
    }

    pub(crate) fn scheduler(&self) -> Rc<dyn AsyncWorkScheduler> {
        self.inner
            .scheduler
            .get_or_init(|| new_scheduler(self.inner.config.async_work_mode))
            .clone()
    }

    /// Run `task` on a later turn of this loop.
    pub fn set_immediate(&self, task: impl FnOnce(&Context) + 'static) {
        self.inner.immediates.borrow_mut().push_back(Box::new(task));
    }

    fn dispatch(&self, posted: Posted) {
        tracing::trace!(kind = posted.kind.as_str(), "Dispatching task");
        (posted.task)(self);
    }

    /// Run one ready task. Returns `false` when nothing was ready.
    pub fn run_once(&self) -> bool {
        let posted = self.inner.rx.borrow_mut().try_recv().ok();
        if let Some(posted) = posted {
            self.dispatch(posted);
            return true;
        }
        let immediate = self.inner.immediates.borrow_mut().pop_front();
        if let Some(task) = immediate {
            task(self);
            return true;
        }
        false
    }

    /// Run ready tasks until none are left, returning how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    // Park until a posted task arrives or `timeout` passes, then run it.
    fn wait_for_task(&self, timeout: Option<Duration>) -> bool {
        let posted = {
            let mut rx = self.inner.rx.borrow_mut();
            self.inner.rt.block_on(async {
                match timeout {
                    Some(t) => tokio::time::timeout(t, rx.recv()).await.ok().flatten(),
                    None => rx.recv().await,
                }
            })
        };
        match posted {
            Some(posted) => {
                self.dispatch(posted);
                true
            }
            None => false,
        }
    }

    /// Turn the loop until `done` returns `true` or `timeout` passes.
    ///
    /// Returns whether `done` was satisfied.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.run_until_idle();
            if done() {
                return true;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.wait_for_task(remaining);
        }
    }

    /// Turn the loop while anything keeps it alive.
    #[instrument(skip_all, level=Level::DEBUG)]
    pub fn run(&self) {
        loop {
            self.run_until_idle();
            if self.inner.handle.active_refs() == 0 {
                break;
            }
            if !self.wait_for_task(None) {
                break;
            }
        }
    }

    /// Tear down every environment on this thread, newest first.
    ///
    /// Cleanup hooks run while the loop can still deliver immediates, so
    /// threadsafe functions and pending finalizers are drained before the
    /// environments go away.
    #[instrument(skip_all, level=Level::DEBUG)]
    pub fn teardown(&self) {
        if self.inner.closing.replace(true) {
            return;
        }
        self.run_until_idle();
        let envs: Vec<Env> = self.inner.envs.borrow().values().rev().cloned().collect();
        for env in envs {
            env.teardown();
            self.run_until_idle();
        }
        if let Some(scheduler) = self.inner.scheduler.get() {
            scheduler.shutdown();
        }
        let dropped = self.inner.immediates.borrow_mut().len();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarding immediates queued during teardown");
            self.inner.immediates.borrow_mut().clear();
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::threads::MessageType;

    fn context() -> Context {
        Context::new(Arc::new(RuntimeConfig::default())).unwrap()
    }

    #[test]
    fn immediates_run_in_order() {
        let ctx = context();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            ctx.set_immediate(move |_| seen.borrow_mut().push(i));
        }
        assert_eq!(ctx.run_until_idle(), 3);
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn immediate_scheduled_from_immediate_runs_in_same_drain() {
        let ctx = context();
        let hits = Rc::new(Cell::new(0));
        let outer = hits.clone();
        ctx.set_immediate(move |ctx| {
            outer.set(outer.get() + 1);
            let inner = outer.clone();
            ctx.set_immediate(move |_| inner.set(inner.get() + 1));
        });
        ctx.run_until_idle();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn posted_task_from_other_thread_runs_on_owner() {
        let ctx = context();
        let handle = ctx.loop_handle();
        let owner = std::thread::current().id();
        let ran_on = Rc::new(Cell::new(None));
        let slot = ran_on.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            handle
                .post(MessageType::AsyncSend, move |_| {
                    tx.send(std::thread::current().id()).unwrap();
                })
                .unwrap();
        });
        assert!(ctx.run_until(
            || {
                if let Ok(id) = rx.try_recv() {
                    slot.set(Some(id));
                }
                slot.get().is_some()
            },
            Some(Duration::from_secs(5))
        ));
        assert_eq!(ran_on.get(), Some(owner));
    }

    #[test]
    fn run_until_times_out() {
        let ctx = context();
        let start = Instant::now();
        assert!(!ctx.run_until(|| false, Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn run_returns_when_last_ref_drops() {
        let ctx = context();
        let handle = ctx.loop_handle();
        handle.ref_loop();
        let remote = handle.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.unref_loop();
        });
        ctx.run();
        assert_eq!(handle.active_refs(), 0);
    }

    #[test]
    fn envs_get_distinct_ids() {
        let ctx = context();
        let a = ctx.create_env();
        let b = ctx.create_env();
        assert_ne!(a.id(), b.id());
        assert_eq!(ctx.env_ids(), vec![a.id(), b.id()]);
        ctx.teardown();
        assert!(ctx.env_ids().is_empty());
    }
}
