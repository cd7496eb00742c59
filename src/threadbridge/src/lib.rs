//! This crate runs a multi-threaded WebAssembly module: it gives the module
//! worker threads behind its `wasi::thread-spawn` import and bridges
//! Node-API style calls across those threads.
//!
//! A [`Runtime`] is built on the main thread with a [`RuntimeBuilder`]. Each
//! thread, the main one and every worker, owns a [`Context`] whose event loop
//! delivers cross-thread work. Native code talks to an [`Env`] through integer
//! handles bounded by handle scopes, keeps values alive across calls with
//! references, calls back onto an owner thread with a [`ThreadsafeFunction`]
//! and offloads blocking work with async work items.
#![warn(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(any(test, debug_assertions), allow(clippy::disallowed_macros))]

mod error;
mod memory;
pub(crate) mod metrics;
mod module;

/// Async work items and their schedulers.
pub mod async_work;
/// Runtime configuration.
pub mod config;
/// Per-thread contexts and their event loops.
pub mod context;
/// Environments, handles, scopes and references.
pub mod env;
/// The main-thread runtime and its builder.
pub mod runtime;
/// Worker threads and the spawn bridge.
pub mod threads;
/// Threadsafe functions.
pub mod tsfn;

/// Execute-then-complete work offloaded from an environment.
pub use async_work::{AsyncWork, WorkState};
/// Configuration types.
pub use config::{AsyncWorkMode, Capabilities, ReuseWorker, RuntimeConfig, WaitThreadStart};
/// A thread's event loop.
pub use context::{Context, LoopHandle};
/// The per-module environment native code talks to.
pub use env::{Env, HandleId, RefId, Value, ValueType};
/// Errors and status codes.
pub use error::{Error, Exception, GuestError, SpawnError, Status};
/// Shared linear memory.
pub use memory::{SharedMemory, WaitOutcome};
/// The module boundary.
pub use module::{EntryPoint, Instance, ThreadContext, ThreadStart, WasmModule};
/// The main-thread entry point.
pub use runtime::Runtime;
/// A builder for creating a new [`Runtime`].
pub use runtime::runtime_builder::RuntimeBuilder;
/// Worker management.
pub use threads::{ThreadManager, ThreadSpawnBridge, WorkerFactory};
/// Cross-thread calls into an owner thread.
pub use tsfn::{CallMode, ReleaseMode, ThreadsafeFunction, ThreadsafeFunctionOptions};

/// The Result of a runtime operation
pub type Result<T> = std::result::Result<T, Error>;
