//! The main-thread entry point.
//!
//! A [`Runtime`] ties one module and its shared memory to the main thread's
//! [`Context`] and to the [`ThreadManager`] that owns the workers. Control
//! messages from workers are handled whenever the main loop turns, so the
//! embedder must keep driving it through [`Runtime::run`],
//! [`Runtime::run_until`] or [`Runtime::run_until_idle`].

use std::sync::Arc;
use std::time::Duration;

use threadbridge_common::constants::tid;
use tracing::{Level, instrument};

use crate::context::Context;
use crate::env::Env;
use crate::memory::SharedMemory;
use crate::module::{Instance, ThreadContext};
use crate::threads::{ThreadManager, ThreadSpawnBridge};
use crate::{Error, Result};

/// Builder for [`Runtime`].
pub mod runtime_builder;

/// A module running on the main thread together with its workers.
///
/// `Runtime` is `!Send`: it must stay on the thread that built it.
pub struct Runtime {
    context: Context,
    threads: Arc<ThreadManager>,
    spawner: ThreadSpawnBridge,
    memory: SharedMemory,
    instance: Instance,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("context", &self.context)
            .field("threads", &self.threads)
            .field("instance", &self.instance)
            .finish()
    }
}

impl Runtime {
    /// The main thread's context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The worker manager.
    pub fn threads(&self) -> &Arc<ThreadManager> {
        &self.threads
    }

    /// The main thread's spawn bridge.
    pub fn spawner(&self) -> &ThreadSpawnBridge {
        &self.spawner
    }

    /// The shared memory.
    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    /// Create an environment on the main thread.
    pub fn create_env(&self) -> Env {
        self.context.create_env()
    }

    /// What module code on the main thread sees.
    pub fn thread_context(&self) -> ThreadContext<'_> {
        ThreadContext::new(&self.context, &self.spawner, &self.memory, tid::MAIN)
    }

    /// Run the module's `initialize` then `start` export, each at most once.
    #[instrument(err(Debug), skip_all, level=Level::INFO)]
    pub fn start(&mut self) -> Result<()> {
        let initialize = self.instance.initialize.take();
        let start = self.instance.start.take();
        let thread = self.thread_context();
        if let Some(initialize) = initialize {
            initialize(&thread).map_err(Error::Guest)?;
        }
        if let Some(start) = start {
            start(&thread).map_err(Error::Guest)?;
        }
        Ok(())
    }

    /// Run ready main-loop tasks, returning how many ran.
    pub fn run_until_idle(&self) -> usize {
        self.context.run_until_idle()
    }

    /// Turn the main loop until `done` holds or `timeout` passes.
    pub fn run_until(&self, done: impl FnMut() -> bool, timeout: Option<Duration>) -> bool {
        self.context.run_until(done, timeout)
    }

    /// Turn the main loop while threads, threadsafe functions or async work
    /// keep it alive.
    pub fn run(&self) {
        self.context.run();
    }

    /// Terminate every worker and tear down the main thread's environments.
    #[instrument(skip_all, level=Level::DEBUG)]
    pub fn shutdown(&self) {
        self.threads.shutdown();
        self.context.teardown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
