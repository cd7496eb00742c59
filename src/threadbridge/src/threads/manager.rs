use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use threadbridge_common::constants::{errno, tid};
use tracing::{Level, instrument};

use super::message::Envelope;
use super::spawn::ThreadSpawnBridge;
use super::worker::{MainPort, WorkerFactory, WorkerId, WorkerOptions, WorkerPort};
use crate::config::RuntimeConfig;
use crate::context::LoopHandle;
use crate::error::SpawnError;
use crate::memory::{Handshake, SharedMemory};
use crate::metrics::MetricsGuard;
use crate::module::WasmModule;

/// Whether a worker is parked in the pool or running a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    /// Waiting in the pool.
    Idle,
    /// Assigned to a thread.
    Running,
}

/// A worker as seen by [`ThreadManager::threads`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    /// Thread id, while the worker runs a thread.
    pub tid: Option<u32>,
    /// The worker.
    pub worker: WorkerId,
    /// Pool state.
    pub state: ThreadState,
    /// Whether the module finished instantiating on the worker.
    pub loaded: bool,
}

pub(crate) struct WorkerEntry {
    port: WorkerPort,
    tid: Option<u32>,
    load_sent: bool,
    loaded: bool,
    _metric_guard: MetricsGuard<WorkerEntry>,
}

#[derive(Default)]
struct Pools {
    unused: VecDeque<WorkerId>,
    running: Vec<WorkerId>,
    workers: HashMap<WorkerId, WorkerEntry>,
    by_tid: HashMap<u32, WorkerId>,
    next_worker_id: u32,
    next_tid_seq: u32,
}

impl Pools {
    // Returns whether `worker` was running.
    fn stop_running(&mut self, worker: WorkerId) -> bool {
        let before = self.running.len();
        self.running.retain(|w| *w != worker);
        self.running.len() != before
    }

    fn detach(&mut self, worker: WorkerId) -> Option<(WorkerEntry, bool)> {
        self.unused.retain(|w| *w != worker);
        let was_running = self.stop_running(worker);
        let entry = self.workers.remove(&worker)?;
        if let Some(tid) = entry.tid {
            self.by_tid.remove(&tid);
        }
        Some((entry, was_running))
    }
}

/// Owns the workers of one runtime and hands them out to new threads.
///
/// Lives on the main thread's side; every worker reports back to it through
/// the main loop. Each running worker holds a keep-alive reference on that
/// loop.
pub struct ThreadManager {
    config: Arc<RuntimeConfig>,
    module: Arc<dyn WasmModule>,
    memory: SharedMemory,
    factory: Arc<dyn WorkerFactory>,
    main: LoopHandle,
    this: Weak<ThreadManager>,
    shut_down: AtomicBool,
    pools: Mutex<Pools>,
}

impl std::fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadManager")
            .field("running", &self.running_count())
            .field("unused", &self.unused_count())
            .finish()
    }
}

impl ThreadManager {
    pub(crate) fn new(
        config: Arc<RuntimeConfig>,
        module: Arc<dyn WasmModule>,
        memory: SharedMemory,
        factory: Arc<dyn WorkerFactory>,
        main: LoopHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            module,
            memory,
            factory,
            main,
            this: this.clone(),
            shut_down: AtomicBool::new(false),
            pools: Mutex::new(Pools::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The memory shared by every thread.
    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub(crate) fn is_main_thread(&self) -> bool {
        self.main.is_owner_thread()
    }

    /// Pre-allocate and load the configured pool.
    #[instrument(err(Debug), skip_all, level=Level::DEBUG)]
    pub fn init(&self) -> Result<(), SpawnError> {
        self.prepare_pool()
    }

    fn prepare_pool(&self) -> Result<(), SpawnError> {
        if !self.config.reuse_worker.is_enabled() || self.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let size = self.config.reuse_worker.size();
        let mut pools = self.lock();
        while pools.workers.len() < size {
            let worker = self.allocate(&mut pools)?;
            self.load(&mut pools, worker, None);
        }
        tracing::debug!(size, "Worker pool prepared");
        Ok(())
    }

    fn allocate(&self, pools: &mut Pools) -> Result<WorkerId, SpawnError> {
        let worker = WorkerId(pools.next_worker_id);
        pools.next_worker_id = pools.next_worker_id.wrapping_add(1);
        let (port, inbox) = WorkerPort::channel();
        let options = WorkerOptions::new(
            worker,
            MainPort::new(self.main.clone(), self.this.clone()),
            self.config.clone(),
        );
        let handle = self
            .factory
            .create_worker(options, inbox)
            .map_err(SpawnError::WorkerCreation)?;
        port.set_join_handle(handle);
        pools.workers.insert(
            worker,
            WorkerEntry {
                port,
                tid: None,
                load_sent: false,
                loaded: false,
                _metric_guard: MetricsGuard::new(),
            },
        );
        pools.unused.push_back(worker);
        tracing::debug!(%worker, "Allocated worker");
        Ok(worker)
    }

    fn load(&self, pools: &mut Pools, worker: WorkerId, handshake: Option<&Handshake>) {
        let Some(entry) = pools.workers.get_mut(&worker) else {
            return;
        };
        if entry.load_sent {
            return;
        }
        entry.load_sent = entry.port.post(Envelope::Load {
            module: self.module.clone(),
            memory: self.memory.clone(),
            handshake: handshake.cloned(),
        });
    }

    /// Take a worker for a new thread, loading the module on it if needed.
    pub(crate) fn get_new_worker(
        &self,
        handshake: Option<&Handshake>,
    ) -> Result<WorkerId, SpawnError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SpawnError::WorkerGone);
        }
        let reuse = self.config.reuse_worker;
        let mut pools = self.lock();
        let worker = match pools.unused.pop_front() {
            Some(worker) => worker,
            None if reuse.is_strict() => {
                return Err(SpawnError::PoolExhausted { size: reuse.size() });
            }
            None => {
                self.allocate(&mut pools)?;
                pools.unused.pop_back().ok_or(SpawnError::WorkerGone)?
            }
        };
        pools.running.push(worker);
        self.main.ref_loop();
        self.load(&mut pools, worker, handshake);
        Ok(worker)
    }

    /// Assign a thread id to `worker` unless it already has one.
    pub(crate) fn mark_id(&self, worker: WorkerId) -> Result<u32, SpawnError> {
        let mut pools = self.lock();
        if let Some(tid) = pools.workers.get(&worker).and_then(|e| e.tid) {
            return Ok(tid);
        }
        let mut candidate = None;
        for _ in 0..tid::RANGE {
            let seq = pools.next_tid_seq;
            pools.next_tid_seq = (seq + 1) % tid::RANGE;
            let id = tid::from_seq(seq);
            if !pools.by_tid.contains_key(&id) {
                candidate = Some(id);
                break;
            }
        }
        let tid = candidate.ok_or(SpawnError::Rejected(errno::EAGAIN))?;
        let entry = pools
            .workers
            .get_mut(&worker)
            .ok_or(SpawnError::WorkerGone)?;
        entry.tid = Some(tid);
        pools.by_tid.insert(tid, worker);
        Ok(tid)
    }

    pub(crate) fn post(&self, worker: WorkerId, envelope: Envelope) -> bool {
        self.lock()
            .workers
            .get(&worker)
            .is_some_and(|entry| entry.port.post(envelope))
    }

    fn return_worker_to_pool(&self, pools: &mut Pools, worker: WorkerId) {
        let Some(entry) = pools.workers.get_mut(&worker) else {
            return;
        };
        if let Some(tid) = entry.tid.take() {
            pools.by_tid.remove(&tid);
        }
        if pools.stop_running(worker) {
            self.main.unref_loop();
        }
        if !pools.unused.contains(&worker) {
            pools.unused.push_back(worker);
        }
    }

    /// Release the worker that ran `tid`. Without `force` and with pooling the
    /// worker goes back to the pool, otherwise it is terminated.
    #[instrument(skip_all, level=Level::DEBUG)]
    pub fn clean_thread(&self, worker: WorkerId, tid: Option<u32>, force: bool) {
        let mut pools = self.lock();
        if !force && self.config.reuse_worker.is_enabled() && !self.shut_down.load(Ordering::SeqCst)
        {
            self.return_worker_to_pool(&mut pools, worker);
            tracing::debug!(%worker, ?tid, "Worker returned to pool");
            return;
        }
        if let Some((entry, was_running)) = pools.detach(worker) {
            entry.port.terminate();
            if was_running {
                self.main.unref_loop();
            }
            tracing::debug!(%worker, ?tid, force, "Worker terminated");
        }
    }

    /// Terminate every worker, then prepare a fresh pool.
    #[instrument(skip_all, level=Level::DEBUG)]
    pub fn terminate_all_threads(&self) {
        let count = self.terminate_workers();
        tracing::warn!(count, "Terminated all threads");
        if let Err(e) = self.prepare_pool() {
            tracing::error!(error = %e, "Failed to prepare worker pool");
        }
    }

    fn terminate_workers(&self) -> usize {
        let (workers, running) = {
            let mut pools = self.lock();
            pools.unused.clear();
            pools.by_tid.clear();
            let running = std::mem::take(&mut pools.running).len();
            (std::mem::take(&mut pools.workers), running)
        };
        for entry in workers.values() {
            entry.port.terminate();
        }
        for _ in 0..running {
            self.main.unref_loop();
        }
        workers.len()
    }

    /// Terminate every worker for good.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.terminate_workers();
        tracing::debug!(count, "Thread manager shut down");
    }

    /// Handle a control message from a worker. Main thread only.
    pub(crate) fn handle_message(&self, envelope: Envelope) {
        tracing::trace!(kind = %envelope.message_type(), "Worker message");
        match envelope {
            Envelope::Loaded { worker } => {
                if let Some(entry) = self.lock().workers.get_mut(&worker) {
                    entry.loaded = true;
                }
            }
            Envelope::CleanupThread { worker, tid } => self.clean_thread(worker, Some(tid), false),
            Envelope::SpawnThread { arg, reply } => {
                // an unanswered reply fails the spawn when dropped
                let Some(manager) = self.this.upgrade() else {
                    return;
                };
                reply.answer(&ThreadSpawnBridge::main(manager).spawn(arg));
            }
            Envelope::TerminateAllThreads => self.terminate_all_threads(),
            Envelope::Error { worker, tid, error } => {
                if error.is_trap() {
                    tracing::error!(%worker, ?tid, %error, "Trap on worker, terminating all threads");
                    self.terminate_all_threads();
                } else {
                    tracing::error!(%worker, ?tid, %error, "Uncaught error on worker");
                    self.clean_thread(worker, tid, true);
                }
            }
            other => {
                tracing::warn!(kind = %other.message_type(), "Unexpected message on main thread");
            }
        }
    }

    /// Every worker with its state.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        let pools = self.lock();
        let mut threads: Vec<ThreadInfo> = pools
            .workers
            .iter()
            .map(|(worker, entry)| ThreadInfo {
                tid: entry.tid,
                worker: *worker,
                state: if pools.running.contains(worker) {
                    ThreadState::Running
                } else {
                    ThreadState::Idle
                },
                loaded: entry.loaded,
            })
            .collect();
        threads.sort_by_key(|t| t.worker);
        threads
    }

    /// The worker currently running `tid`.
    pub fn worker_for(&self, tid: u32) -> Option<WorkerId> {
        self.lock().by_tid.get(&tid).copied()
    }

    /// Workers assigned to threads.
    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Workers parked in the pool.
    pub fn unused_count(&self) -> usize {
        self.lock().unused.len()
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
