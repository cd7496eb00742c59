//! Async work: run a blocking `execute` off the event loop, then deliver
//! `complete` back on the thread that queued it.
//!
//! Two strategies implement [`AsyncWorkScheduler`], picked once per
//! [`Context`] from [`AsyncWorkMode`]:
//!
//! - [`cooperative::CooperativeScheduler`] runs `execute` from immediates on
//!   the owner thread, with a bound on items in flight.
//! - [`pool::WorkerPoolScheduler`] hands `execute` to a fixed set of lazily
//!   spawned pool threads fed from one FIFO queue.
//!
//! Either way `complete` runs exactly once per queued item, on the owner
//! thread, inside a handle scope. Cancelling is only possible while the item
//! is still queued.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{Level, instrument};

use crate::config::AsyncWorkMode;
use crate::context::{Context, LoopHandle};
use crate::env::Env;
use crate::error::{Exception, Status};
use crate::metrics::{METRIC_ASYNC_WORK_COMPLETED, METRIC_STATUS_LABEL, MetricsGuard};
use crate::{Error, Result};

pub(crate) mod cooperative;
pub(crate) mod pool;

/// Body of an async work item, run off the owner loop.
pub type Execute = Arc<dyn Fn() + Send + Sync>;

/// Completion callback, run on the owner thread.
pub type Complete = Box<dyn FnMut(&Env, Status)>;

/// Identity of an async work item within its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncWork(u64);

/// Lifecycle of an async work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkState {
    /// Created, not queued.
    Created = 0,
    /// Waiting for a slot.
    Queued = 1,
    /// `execute` has been handed out.
    Running = 2,
    /// `complete` ran with a final status.
    Completed = 3,
    /// Removed from the queue before it ran.
    Cancelled = 4,
}

impl WorkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkState::Queued,
            2 => WorkState::Running,
            3 => WorkState::Completed,
            4 => WorkState::Cancelled,
            _ => WorkState::Created,
        }
    }
}

pub(crate) struct WorkRecord {
    resource_name: String,
    execute: Execute,
    complete: Rc<RefCell<Complete>>,
    async_id: u64,
    state: Arc<AtomicU8>,
    _metric_guard: MetricsGuard<WorkRecord>,
}

impl WorkRecord {
    fn state(&self) -> WorkState {
        WorkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_outstanding(&self) -> bool {
        matches!(self.state(), WorkState::Queued | WorkState::Running)
    }

    pub(crate) fn resource_name(&self) -> &str {
        &self.resource_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct JobKey {
    pub(crate) env: u32,
    pub(crate) work: u64,
}

/// A queued item as the scheduler sees it.
pub(crate) struct Job {
    pub(crate) key: JobKey,
    pub(crate) execute: Execute,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) owner: LoopHandle,
}

impl Job {
    /// Claim the job for execution. Fails when it was cancelled meanwhile.
    pub(crate) fn start(&self) -> bool {
        self.state
            .compare_exchange(
                WorkState::Queued as u8,
                WorkState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Run `execute`, reporting a panic as a generic failure.
    pub(crate) fn run(&self) -> Status {
        match catch_unwind(AssertUnwindSafe(|| (self.execute)())) {
            Ok(()) => Status::Ok,
            Err(payload) => {
                let exception = Exception::from_panic(payload.as_ref());
                tracing::error!(
                    env = self.key.env,
                    work = self.key.work,
                    %exception,
                    "Async work panicked"
                );
                Status::GenericFailure
            }
        }
    }
}

/// Strategy that decides where `execute` runs.
pub(crate) trait AsyncWorkScheduler {
    /// Accept a job. Its completion must eventually reach
    /// [`deliver_completion`] on the owner loop unless it is cancelled.
    fn queue(&self, ctx: &Context, job: Job);
    /// Remove a job that has not started. Returns whether it was found.
    fn cancel(&self, key: JobKey) -> bool;
    /// Drop queued jobs and stop any threads.
    fn shutdown(&self);
    /// Strategy name for diagnostics.
    fn name(&self) -> &'static str;
}

pub(crate) fn new_scheduler(mode: AsyncWorkMode) -> Rc<dyn AsyncWorkScheduler> {
    tracing::debug!(?mode, "Creating async work scheduler");
    match mode {
        AsyncWorkMode::Cooperative { max_in_flight } => {
            Rc::new(cooperative::CooperativeScheduler::new(max_in_flight))
        }
        AsyncWorkMode::WorkerPool { size } => Rc::new(pool::WorkerPoolScheduler::new(size)),
    }
}

/// Run `complete` for a finished or cancelled job. Owner thread only.
#[instrument(skip_all, level=Level::TRACE)]
pub(crate) fn deliver_completion(ctx: &Context, key: JobKey, status: Status) {
    ctx.loop_handle().unref_loop();
    metrics::counter!(METRIC_ASYNC_WORK_COMPLETED, METRIC_STATUS_LABEL => status.as_str())
        .increment(1);
    let Some(env) = ctx.env(key.env) else {
        tracing::debug!(env = key.env, work = key.work, "Environment gone, completion dropped");
        return;
    };
    let complete = env.with_state(|st| {
        let record = st.works.get(&key.work)?;
        let done = if status == Status::Cancelled {
            WorkState::Cancelled
        } else {
            WorkState::Completed
        };
        record.state.store(done as u8, Ordering::SeqCst);
        Some(record.complete.clone())
    });
    let Some(complete) = complete else {
        return;
    };
    #[cfg(feature = "function_call_metrics")]
    let _metric_guard = crate::metrics::CallbackMetricGuard::new("async_work_complete");
    env.invoke_from_loop(|env| env.with_handle_scope(|env| (complete.borrow_mut())(env, status)));
}

impl Env {
    fn work_state(&self, work: AsyncWork) -> Result<Arc<AtomicU8>> {
        self.with_state(|st| {
            st.works
                .get(&work.0)
                .map(|record| record.state.clone())
                .ok_or_else(|| Error::invalid_arg("unknown async work"))
        })
    }

    /// Create an async work item.
    pub fn create_async_work(
        &self,
        resource_name: &str,
        execute: impl Fn() + Send + Sync + 'static,
        complete: impl FnMut(&Env, Status) + 'static,
    ) -> Result<AsyncWork> {
        let ctx = self.context().ok_or(Error::LoopClosed)?;
        let async_id = ctx.next_async_id();
        let id = self.with_state(|st| {
            let id = st.next_id();
            st.works.insert(
                id,
                WorkRecord {
                    resource_name: resource_name.to_string(),
                    execute: Arc::new(execute),
                    complete: Rc::new(RefCell::new(Box::new(complete))),
                    async_id,
                    state: Arc::new(AtomicU8::new(WorkState::Created as u8)),
                    _metric_guard: MetricsGuard::new(),
                },
            );
            id
        });
        Ok(AsyncWork(id))
    }

    /// Hand an item to this thread's scheduler.
    #[instrument(err(Debug), skip_all, level=Level::DEBUG)]
    pub fn queue_async_work(&self, work: AsyncWork) -> Result<()> {
        let ctx = self.context().ok_or(Error::LoopClosed)?;
        let job = self.with_state(|st| {
            let record = st
                .works
                .get(&work.0)
                .ok_or_else(|| Error::invalid_arg("unknown async work"))?;
            if record.is_outstanding() {
                return Err(Error::invalid_arg("async work is already queued"));
            }
            record
                .state
                .store(WorkState::Queued as u8, Ordering::SeqCst);
            tracing::trace!(
                work = work.0,
                async_id = record.async_id,
                resource = %record.resource_name,
                "Queueing async work"
            );
            Ok(Job {
                key: JobKey {
                    env: self.id(),
                    work: work.0,
                },
                execute: record.execute.clone(),
                state: record.state.clone(),
                owner: self.loop_handle().clone(),
            })
        })?;
        ctx.loop_handle().ref_loop();
        ctx.scheduler().queue(&ctx, job);
        Ok(())
    }

    /// Cancel an item that has not started. Its completion still runs, later,
    /// with [`Status::Cancelled`].
    #[instrument(err(Debug), skip_all, level=Level::DEBUG)]
    pub fn cancel_async_work(&self, work: AsyncWork) -> Result<()> {
        let ctx = self.context().ok_or(Error::LoopClosed)?;
        let state = self.work_state(work)?;
        if WorkState::from_u8(state.load(Ordering::SeqCst)) != WorkState::Queued {
            return Err(Error::GenericFailure(
                "async work is not queued or has already started".to_string(),
            ));
        }
        let key = JobKey {
            env: self.id(),
            work: work.0,
        };
        if !ctx.scheduler().cancel(key) {
            return Err(Error::GenericFailure(
                "async work has already started".to_string(),
            ));
        }
        state.store(WorkState::Cancelled as u8, Ordering::SeqCst);
        ctx.set_immediate(move |ctx| deliver_completion(ctx, key, Status::Cancelled));
        Ok(())
    }

    /// Free an item. Fails while it is queued or running.
    pub fn delete_async_work(&self, work: AsyncWork) -> Result<()> {
        let record = self.with_state(|st| {
            match st.works.get(&work.0) {
                None => Err(Error::invalid_arg("unknown async work")),
                Some(record) if record.is_outstanding() => Err(Error::invalid_arg(
                    "async work cannot be deleted while queued or running",
                )),
                Some(_) => Ok(st.works.remove(&work.0)),
            }
        })?;
        drop(record);
        Ok(())
    }

    /// Current state of an item.
    pub fn async_work_state(&self, work: AsyncWork) -> Result<WorkState> {
        Ok(WorkState::from_u8(self.work_state(work)?.load(Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::config::RuntimeConfig;

    fn setup(mode: AsyncWorkMode) -> (Context, Env) {
        let config = RuntimeConfig {
            async_work_mode: mode,
            ..Default::default()
        };
        let ctx = Context::new(Arc::new(config)).unwrap();
        let env = ctx.create_env();
        (ctx, env)
    }

    fn completions() -> (Rc<RefCell<Vec<Status>>>, impl FnMut(&Env, Status) + 'static) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |_: &Env, status| sink.borrow_mut().push(status))
    }

    #[test]
    fn cooperative_runs_on_owner_thread() {
        let (ctx, env) = setup(AsyncWorkMode::Cooperative { max_in_flight: 1 });
        let owner = std::thread::current().id();
        let ran_on = Arc::new(std::sync::Mutex::new(None));
        let slot = ran_on.clone();
        let (seen, complete) = completions();
        let work = env
            .create_async_work(
                "coop",
                move || *slot.lock().unwrap() = Some(std::thread::current().id()),
                complete,
            )
            .unwrap();
        env.queue_async_work(work).unwrap();
        assert!(env.queue_async_work(work).is_err());
        ctx.run_until_idle();
        assert_eq!(*ran_on.lock().unwrap(), Some(owner));
        assert_eq!(*seen.borrow(), vec![Status::Ok]);
        assert_eq!(env.async_work_state(work).unwrap(), WorkState::Completed);
        env.delete_async_work(work).unwrap();
    }

    #[test]
    fn cooperative_cancel_before_dispatch() {
        let (ctx, env) = setup(AsyncWorkMode::Cooperative { max_in_flight: 1 });
        let runs = Arc::new(AtomicUsize::new(0));
        let mut works = Vec::new();
        let (seen, _) = completions();
        for _ in 0..2 {
            let runs = runs.clone();
            let sink = seen.clone();
            works.push(
                env.create_async_work(
                    "coop",
                    move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                    },
                    move |_, status| sink.borrow_mut().push(status),
                )
                .unwrap(),
            );
        }
        env.queue_async_work(works[0]).unwrap();
        env.queue_async_work(works[1]).unwrap();
        assert!(env.delete_async_work(works[1]).is_err());
        env.cancel_async_work(works[1]).unwrap();
        assert!(env.cancel_async_work(works[1]).is_err());
        ctx.run_until_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(seen.borrow().len(), 2);
        assert!(seen.borrow().contains(&Status::Cancelled));
        assert_eq!(ctx.loop_handle().active_refs(), 0);
    }

    #[test]
    fn panicking_execute_reports_generic_failure() {
        let (ctx, env) = setup(AsyncWorkMode::WorkerPool { size: 1 });
        let (seen, complete) = completions();
        let work = env
            .create_async_work("boom", || panic!("execute failed"), complete)
            .unwrap();
        env.queue_async_work(work).unwrap();
        assert!(ctx.run_until(|| !seen.borrow().is_empty(), Some(Duration::from_secs(5))));
        assert_eq!(*seen.borrow(), vec![Status::GenericFailure]);
    }

    #[test]
    fn completion_runs_once_on_owner_thread() {
        let (ctx, env) = setup(AsyncWorkMode::WorkerPool { size: 2 });
        let owner = std::thread::current().id();
        let executed_on = Arc::new(std::sync::Mutex::new(None));
        let slot = executed_on.clone();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let work = env
            .create_async_work(
                "pool",
                move || *slot.lock().unwrap() = Some(std::thread::current().id()),
                move |_, status| {
                    assert_eq!(std::thread::current().id(), owner);
                    assert_eq!(status, Status::Ok);
                    counter.set(counter.get() + 1);
                },
            )
            .unwrap();
        env.queue_async_work(work).unwrap();
        ctx.run();
        assert_eq!(hits.get(), 1);
        assert_ne!(*executed_on.lock().unwrap(), Some(owner));
    }
}
