//! Worker threads for a module's `wasi::thread-spawn` import.
//!
//! The [`ThreadManager`] lives with the main thread and owns every worker.
//! Workers talk back to it only through messages posted to the main loop;
//! module code reaches it through a [`ThreadSpawnBridge`].

mod manager;
mod message;
mod spawn;
mod worker;

pub(crate) use manager::WorkerEntry;
pub use manager::{ThreadInfo, ThreadManager, ThreadState};
pub use message::MessageType;
pub use spawn::ThreadSpawnBridge;
pub use worker::{ThreadWorkerFactory, WorkerFactory, WorkerId, WorkerInbox, WorkerOptions};
