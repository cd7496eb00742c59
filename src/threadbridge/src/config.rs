//! Runtime configuration.
//!
//! [`RuntimeConfig`] can be built in code through
//! [`RuntimeBuilder`](crate::RuntimeBuilder) or parsed from the JSON shape a
//! loader script would pass:
//!
//! ```json
//! {
//!   "reuseWorker": { "size": 4, "strict": true },
//!   "waitThreadStart": 1000,
//!   "asyncWorkMode": { "type": "workerPool", "size": 4 }
//! }
//! ```
//!
//! # Environment
//!
//! The default async work pool size is read once from `UV_THREADPOOL_SIZE`:
//!
//! ```bash
//! export UV_THREADPOOL_SIZE=8  # Default is 4
//! ```

use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable that sets the default async work pool size.
pub(crate) const ENV_THREADPOOL_SIZE: &str = "UV_THREADPOOL_SIZE";

const DEFAULT_THREADPOOL_SIZE: usize = 4;

/// Upper bound of callbacks delivered per threadsafe function dispatch pass.
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 1000;

static THREADPOOL_SIZE: LazyLock<usize> = LazyLock::new(|| {
    let size = std::env::var(ENV_THREADPOOL_SIZE)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_THREADPOOL_SIZE);
    tracing::debug!(size, "Resolved async work pool size");
    size
});

/// The async work pool size taken from the environment, or the default.
pub fn default_threadpool_size() -> usize {
    *THREADPOOL_SIZE
}

/// Worker pooling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReuseWorkerRepr", into = "ReuseWorkerRepr")]
pub enum ReuseWorker {
    /// Every spawn creates a fresh worker that is terminated on exit.
    Disabled,
    /// Exited workers go back to a pool.
    Pool {
        /// Workers created up front.
        size: usize,
        /// Fail instead of growing the pool once `size` workers are busy.
        strict: bool,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ReuseWorkerRepr {
    Flag(bool),
    Pool {
        #[serde(default)]
        size: usize,
        #[serde(default)]
        strict: bool,
    },
}

impl From<ReuseWorkerRepr> for ReuseWorker {
    fn from(repr: ReuseWorkerRepr) -> Self {
        match repr {
            ReuseWorkerRepr::Flag(false) => ReuseWorker::Disabled,
            ReuseWorkerRepr::Flag(true) => ReuseWorker::Pool {
                size: 0,
                strict: false,
            },
            ReuseWorkerRepr::Pool { size, strict } => ReuseWorker::Pool { size, strict },
        }
    }
}

impl From<ReuseWorker> for ReuseWorkerRepr {
    fn from(value: ReuseWorker) -> Self {
        match value {
            ReuseWorker::Disabled => ReuseWorkerRepr::Flag(false),
            ReuseWorker::Pool { size, strict } => ReuseWorkerRepr::Pool { size, strict },
        }
    }
}

impl ReuseWorker {
    /// Whether exited workers are kept.
    pub fn is_enabled(&self) -> bool {
        matches!(self, ReuseWorker::Pool { .. })
    }

    /// Number of workers to create up front.
    pub fn size(&self) -> usize {
        match self {
            ReuseWorker::Disabled => 0,
            ReuseWorker::Pool { size, .. } => *size,
        }
    }

    /// Whether the pool refuses to grow.
    pub fn is_strict(&self) -> bool {
        matches!(self, ReuseWorker::Pool { strict: true, .. })
    }
}

/// How long a spawning thread waits for the new thread to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WaitRepr", into = "WaitRepr")]
pub enum WaitThreadStart {
    /// Return as soon as the start message is posted.
    NoWait,
    /// Wait until the thread reports, however long it takes.
    Forever,
    /// Wait at most this long, then tear the worker down.
    Timeout(Duration),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WaitRepr {
    Flag(bool),
    Millis(u64),
}

impl From<WaitRepr> for WaitThreadStart {
    fn from(repr: WaitRepr) -> Self {
        match repr {
            WaitRepr::Flag(false) => WaitThreadStart::NoWait,
            WaitRepr::Flag(true) => WaitThreadStart::Forever,
            WaitRepr::Millis(ms) => WaitThreadStart::Timeout(Duration::from_millis(ms)),
        }
    }
}

impl From<WaitThreadStart> for WaitRepr {
    fn from(value: WaitThreadStart) -> Self {
        match value {
            WaitThreadStart::NoWait => WaitRepr::Flag(false),
            WaitThreadStart::Forever => WaitRepr::Flag(true),
            WaitThreadStart::Timeout(d) => WaitRepr::Millis(d.as_millis() as u64),
        }
    }
}

impl WaitThreadStart {
    /// Whether a handshake is needed at all.
    pub fn waits(&self) -> bool {
        !matches!(self, WaitThreadStart::NoWait)
    }

    /// The bound on the wait, if any.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            WaitThreadStart::Timeout(d) => Some(*d),
            _ => None,
        }
    }
}

/// Where async work executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AsyncWorkMode {
    /// Run `execute` on the owner thread from the event loop.
    Cooperative {
        /// Items allowed between queue and completion at once.
        max_in_flight: usize,
    },
    /// Run `execute` on dedicated pool threads.
    WorkerPool {
        /// Number of pool threads.
        size: usize,
    },
}

impl Default for AsyncWorkMode {
    fn default() -> Self {
        AsyncWorkMode::WorkerPool {
            size: default_threadpool_size(),
        }
    }
}

/// What the host can do, resolved once when the runtime is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    /// Values can be held without keeping them alive.
    pub weak_references: bool,
    /// Collected values notify their finalizers.
    pub finalization: bool,
    /// The main thread may park in a wait. When `false` it spins instead.
    pub blocking_wait_on_main: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            weak_references: true,
            finalization: true,
            blocking_wait_on_main: true,
        }
    }
}

/// Configuration shared by every thread of a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Worker pooling policy.
    pub reuse_worker: ReuseWorker,
    /// Spawn handshake policy.
    pub wait_thread_start: WaitThreadStart,
    /// Async work strategy.
    pub async_work_mode: AsyncWorkMode,
    /// Callbacks per threadsafe function dispatch pass.
    pub dispatch_batch_size: usize,
    /// Abort the process on protocol violations instead of poisoning the env.
    pub abort_on_fatal: bool,
    /// Host capabilities.
    pub capabilities: Capabilities,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reuse_worker: ReuseWorker::Disabled,
            wait_thread_start: WaitThreadStart::Forever,
            async_work_mode: AsyncWorkMode::default(),
            dispatch_batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            abort_on_fatal: false,
            capabilities: Capabilities::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_batch_size == 0 {
            return Err(Error::Config(
                "dispatchBatchSize must be non-zero".to_string(),
            ));
        }
        if let ReuseWorker::Pool { size: 0, strict: true } = self.reuse_worker {
            return Err(Error::Config(
                "a strict worker pool needs a non-zero size".to_string(),
            ));
        }
        match self.async_work_mode {
            AsyncWorkMode::Cooperative { max_in_flight: 0 } => {
                return Err(Error::Config(
                    "asyncWorkMode.maxInFlight must be non-zero".to_string(),
                ));
            }
            AsyncWorkMode::WorkerPool { size: 0 } => {
                return Err(Error::Config(
                    "asyncWorkMode.size must be non-zero".to_string(),
                ));
            }
            _ => {}
        }
        if let WaitThreadStart::Timeout(d) = self.wait_thread_start
            && d.is_zero()
        {
            return Err(Error::Config(
                "waitThreadStart timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
