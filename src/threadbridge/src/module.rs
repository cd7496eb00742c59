//! The boundary between the runtime and a compiled module.
//!
//! A [`WasmModule`] is instantiated once per thread against the shared
//! memory. The resulting [`Instance`] exposes a fixed set of optional entry
//! points; module code reaches back into the runtime through a
//! [`ThreadContext`].

use crate::context::Context;
use crate::error::{GuestError, SpawnError};
use crate::memory::SharedMemory;
use crate::threads::ThreadSpawnBridge;

/// One-shot entry point such as `_initialize` or `_start`.
pub type EntryPoint = Box<dyn FnOnce(&ThreadContext<'_>) -> Result<(), GuestError>>;

/// `wasi_thread_start(tid, start_arg)`.
pub type ThreadStart = Box<dyn FnMut(&ThreadContext<'_>, u32, u32) -> Result<(), GuestError>>;

/// A compiled module that can be instantiated on any thread.
pub trait WasmModule: Send + Sync {
    /// Create an instance bound to `memory` on the calling thread.
    fn instantiate(&self, memory: &SharedMemory) -> anyhow::Result<Instance>;
}

impl<F> WasmModule for F
where
    F: Fn(&SharedMemory) -> anyhow::Result<Instance> + Send + Sync,
{
    fn instantiate(&self, memory: &SharedMemory) -> anyhow::Result<Instance> {
        self(memory)
    }
}

/// The exports of an instantiated module.
pub struct Instance {
    /// The memory the instance runs against.
    pub memory: SharedMemory,
    /// Reactor initializer, run once on the main thread.
    pub initialize: Option<EntryPoint>,
    /// Command entry point, run once on the main thread.
    pub start: Option<EntryPoint>,
    /// Entry point of every spawned thread.
    pub wasi_thread_start: Option<ThreadStart>,
}

impl Instance {
    /// An instance with no entry points.
    pub fn new(memory: SharedMemory) -> Self {
        Self {
            memory,
            initialize: None,
            start: None,
            wasi_thread_start: None,
        }
    }

    /// Set `initialize`.
    pub fn with_initialize(
        mut self,
        f: impl FnOnce(&ThreadContext<'_>) -> Result<(), GuestError> + 'static,
    ) -> Self {
        self.initialize = Some(Box::new(f));
        self
    }

    /// Set `start`.
    pub fn with_start(
        mut self,
        f: impl FnOnce(&ThreadContext<'_>) -> Result<(), GuestError> + 'static,
    ) -> Self {
        self.start = Some(Box::new(f));
        self
    }

    /// Set `wasi_thread_start`.
    pub fn with_wasi_thread_start(
        mut self,
        f: impl FnMut(&ThreadContext<'_>, u32, u32) -> Result<(), GuestError> + 'static,
    ) -> Self {
        self.wasi_thread_start = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("memory", &self.memory)
            .field("initialize", &self.initialize.is_some())
            .field("start", &self.start.is_some())
            .field("wasi_thread_start", &self.wasi_thread_start.is_some())
            .finish()
    }
}

/// What module code running on a thread can reach.
pub struct ThreadContext<'a> {
    context: &'a Context,
    spawner: &'a ThreadSpawnBridge,
    memory: &'a SharedMemory,
    tid: u32,
}

impl<'a> ThreadContext<'a> {
    pub(crate) fn new(
        context: &'a Context,
        spawner: &'a ThreadSpawnBridge,
        memory: &'a SharedMemory,
        tid: u32,
    ) -> Self {
        Self {
            context,
            spawner,
            memory,
            tid,
        }
    }

    /// The calling thread's context.
    pub fn context(&self) -> &'a Context {
        self.context
    }

    /// The shared memory.
    pub fn memory(&self) -> &'a SharedMemory {
        self.memory
    }

    /// Id of the calling thread, `0` on the main thread.
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// The spawn bridge of the calling thread.
    pub fn spawner(&self) -> &'a ThreadSpawnBridge {
        self.spawner
    }

    /// Start a thread running `wasi_thread_start(tid, arg)`.
    pub fn spawn(&self, arg: u32) -> Result<u32, SpawnError> {
        self.spawner.spawn(arg)
    }

    /// Legacy ABI: the new tid, or `-errno`.
    pub fn thread_spawn(&self, arg: u32) -> i32 {
        self.spawner.thread_spawn(arg)
    }

    /// Result-struct ABI, see [`ThreadSpawnBridge::thread_spawn_with_result`].
    pub fn thread_spawn_with_result(&self, arg: u32, result_ptr: usize) -> i32 {
        self.spawner.thread_spawn_with_result(arg, result_ptr)
    }

    /// Tear every worker down.
    pub fn terminate_all_threads(&self) {
        self.spawner.terminate_all_threads();
    }
}
