use std::sync::Arc;

use tracing::{Level, instrument};

use super::Runtime;
use crate::Result;
use crate::config::{AsyncWorkMode, Capabilities, ReuseWorker, RuntimeConfig, WaitThreadStart};
use crate::context::Context;
use crate::memory::SharedMemory;
use crate::module::WasmModule;
use crate::threads::{ThreadManager, ThreadSpawnBridge, ThreadWorkerFactory, WorkerFactory};

/// A builder for a [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    factory: Arc<dyn WorkerFactory>,
}

impl RuntimeBuilder {
    /// Create a new RuntimeBuilder with the default configuration
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            factory: Arc::new(ThreadWorkerFactory),
        }
    }

    /// Replace the whole configuration, e.g. one parsed with
    /// [`RuntimeConfig::from_json`]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the worker pooling policy
    pub fn with_reuse_worker(mut self, reuse_worker: ReuseWorker) -> Self {
        self.config.reuse_worker = reuse_worker;
        self
    }

    /// Set how long a spawning thread waits for the new thread to report
    pub fn with_wait_thread_start(mut self, wait: WaitThreadStart) -> Self {
        self.config.wait_thread_start = wait;
        self
    }

    /// Set where async work executes
    pub fn with_async_work_mode(mut self, mode: AsyncWorkMode) -> Self {
        self.config.async_work_mode = mode;
        self
    }

    /// Set the number of threadsafe function callbacks delivered per
    /// dispatch pass
    pub fn with_dispatch_batch_size(mut self, size: usize) -> Self {
        self.config.dispatch_batch_size = size;
        self
    }

    /// Abort the process on protocol violations instead of poisoning the
    /// environment
    pub fn with_abort_on_fatal(mut self, abort: bool) -> Self {
        self.config.abort_on_fatal = abort;
        self
    }

    /// Set the host capabilities
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    /// Use a custom worker factory instead of one OS thread per worker
    pub fn with_worker_factory(mut self, factory: impl WorkerFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Get the current configuration
    pub fn get_config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Build the Runtime on the calling thread, which becomes the main thread.
    ///
    /// The worker pool is prepared and the module is instantiated for the
    /// main thread; no entry point runs until [`Runtime::start`].
    #[instrument(err(Debug), skip_all, level=Level::INFO)]
    pub fn build(self, module: Arc<dyn WasmModule>, memory: SharedMemory) -> Result<Runtime> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let context = Context::new(config.clone())?;
        let threads = ThreadManager::new(
            config,
            module.clone(),
            memory.clone(),
            self.factory,
            context.loop_handle(),
        );
        threads.init()?;
        let instance = module.instantiate(&memory)?;
        let spawner = ThreadSpawnBridge::main(threads.clone());
        tracing::debug!(shared = memory.is_shared(), "Runtime built");
        Ok(Runtime {
            context,
            threads,
            spawner,
            memory,
            instance,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
