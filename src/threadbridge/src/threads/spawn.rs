use std::sync::Arc;

use threadbridge_common::layout::spawn_result;
use tracing::{Level, instrument};

use super::manager::ThreadManager;
use super::message::Envelope;
use super::worker::MainPort;
use crate::error::SpawnError;
use crate::memory::{Handshake, HandshakeOutcome, SharedMemory};
use crate::metrics::{METRIC_REASON_LABEL, METRIC_THREAD_SPAWN_FAILURES, METRIC_THREADS_SPAWNED};

enum Route {
    Main(Arc<ThreadManager>),
    Worker { main: MainPort, memory: SharedMemory },
}

/// The `wasi::thread-spawn` import of one thread.
///
/// On the main thread it drives the [`ThreadManager`] directly. On a worker
/// it forwards the request to the main thread and blocks until the answer is
/// written back into a small shared record.
pub struct ThreadSpawnBridge {
    route: Route,
}

impl std::fmt::Debug for ThreadSpawnBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSpawnBridge")
            .field("main", &self.is_main())
            .finish()
    }
}

impl ThreadSpawnBridge {
    pub(crate) fn main(manager: Arc<ThreadManager>) -> Self {
        Self {
            route: Route::Main(manager),
        }
    }

    pub(crate) fn worker(main: MainPort, memory: SharedMemory) -> Self {
        Self {
            route: Route::Worker { main, memory },
        }
    }

    /// Whether this bridge belongs to the main thread.
    pub fn is_main(&self) -> bool {
        matches!(self.route, Route::Main(_))
    }

    fn memory(&self) -> &SharedMemory {
        match &self.route {
            Route::Main(manager) => manager.memory(),
            Route::Worker { memory, .. } => memory,
        }
    }

    /// Start a thread running `wasi_thread_start(tid, arg)` and return its id.
    pub fn spawn(&self, arg: u32) -> Result<u32, SpawnError> {
        match &self.route {
            Route::Main(manager) => {
                let result = spawn_on_main(manager, arg);
                match &result {
                    Ok(_) => metrics::counter!(METRIC_THREADS_SPAWNED).increment(1),
                    Err(e) => metrics::counter!(
                        METRIC_THREAD_SPAWN_FAILURES,
                        METRIC_REASON_LABEL => e.reason()
                    )
                    .increment(1),
                }
                result
            }
            Route::Worker { main, memory } => forward_spawn(main, memory, arg),
        }
    }

    /// Legacy ABI: the new tid, or `-errno` on failure.
    pub fn thread_spawn(&self, arg: u32) -> i32 {
        match self.spawn(arg) {
            Ok(tid) => tid as i32,
            Err(e) => -e.errno(),
        }
    }

    /// Result-struct ABI: writes `{ is_error, tid_or_errno }` at `result_ptr`
    /// in shared memory and returns `0`, or `1` when the pointer is unusable.
    pub fn thread_spawn_with_result(&self, arg: u32, result_ptr: usize) -> i32 {
        let memory = self.memory();
        if result_ptr % spawn_result::ALIGN != 0
            || memory
                .index_of(result_ptr + spawn_result::TID_OR_ERRNO_OFFSET)
                .is_none()
        {
            tracing::warn!(result_ptr, "Invalid spawn result pointer");
            return 1;
        }
        let result = self.spawn(arg);
        if write_spawn_result(memory, result_ptr, &result) {
            0
        } else {
            1
        }
    }

    /// Tear every worker down. From a worker this is a request to the main
    /// thread and returns immediately.
    pub fn terminate_all_threads(&self) {
        match &self.route {
            Route::Main(manager) => manager.terminate_all_threads(),
            Route::Worker { main, .. } => {
                main.send(Envelope::TerminateAllThreads);
            }
        }
    }
}

#[instrument(err(Debug), skip(manager), level=Level::DEBUG)]
fn spawn_on_main(manager: &Arc<ThreadManager>, arg: u32) -> Result<u32, SpawnError> {
    if !manager.memory().is_shared() {
        return Err(SpawnError::MemoryNotShared);
    }
    let wait = manager.config().wait_thread_start;
    let spin_only =
        manager.is_main_thread() && !manager.config().capabilities.blocking_wait_on_main;
    let handshake = wait.waits().then(Handshake::new);

    let worker = manager.get_new_worker(handshake.as_ref())?;
    let tid = match manager.mark_id(worker) {
        Ok(tid) => tid,
        Err(e) => {
            manager.clean_thread(worker, None, true);
            return Err(e);
        }
    };
    let posted = manager.post(
        worker,
        Envelope::Start {
            tid,
            arg,
            handshake: handshake.clone(),
        },
    );
    if !posted {
        manager.clean_thread(worker, Some(tid), true);
        return Err(SpawnError::WorkerGone);
    }

    let Some(handshake) = handshake else {
        return Ok(tid);
    };
    match handshake.wait(wait.timeout(), spin_only) {
        HandshakeOutcome::Started => {
            tracing::debug!(%worker, tid, "Thread started");
            Ok(tid)
        }
        HandshakeOutcome::Failed(exception) => {
            tracing::warn!(%worker, tid, %exception, "Thread failed to start");
            manager.clean_thread(worker, Some(tid), true);
            Err(SpawnError::Startup(exception))
        }
        HandshakeOutcome::TimedOut => {
            let timeout = wait.timeout().unwrap_or_default();
            tracing::warn!(%worker, tid, ?timeout, "Thread did not start in time");
            manager.clean_thread(worker, Some(tid), true);
            Err(SpawnError::TimedOut(timeout))
        }
    }
}

fn forward_spawn(main: &MainPort, memory: &SharedMemory, arg: u32) -> Result<u32, SpawnError> {
    if !memory.is_shared() {
        return Err(SpawnError::MemoryNotShared);
    }
    let reply = SharedMemory::new_shared(spawn_result::SIZE);
    if !main.send(Envelope::SpawnThread {
        arg,
        reply: SpawnReply::new(reply.clone()),
    }) {
        return Err(SpawnError::WorkerGone);
    }
    let index = spawn_result::TID_OR_ERRNO_OFFSET / 4;
    reply.wait(index, 0, None);
    let value = reply.load(index);
    if reply.load(spawn_result::IS_ERROR_OFFSET / 4) != 0 {
        Err(SpawnError::Rejected(value))
    } else {
        Ok(value as u32)
    }
}

/// The record a worker waits on for a forwarded spawn.
///
/// Dropping it unanswered, because the main loop closed or the manager is
/// gone, writes a failure so the worker stops waiting.
pub(crate) struct SpawnReply {
    record: SharedMemory,
    answered: bool,
}

impl SpawnReply {
    pub(crate) fn new(record: SharedMemory) -> Self {
        Self {
            record,
            answered: false,
        }
    }

    pub(crate) fn answer(mut self, result: &Result<u32, SpawnError>) {
        self.answered = write_spawn_result(&self.record, 0, result);
    }
}

impl Drop for SpawnReply {
    fn drop(&mut self) {
        if !self.answered {
            tracing::debug!("Spawn request dropped unanswered");
            write_spawn_result(&self.record, 0, &Err(SpawnError::WorkerGone));
        }
    }
}

/// Write a spawn result record at `ptr` and wake anyone waiting on it.
pub(crate) fn write_spawn_result(
    memory: &SharedMemory,
    ptr: usize,
    result: &Result<u32, SpawnError>,
) -> bool {
    let (Some(is_error), Some(value)) = (
        memory.index_of(ptr + spawn_result::IS_ERROR_OFFSET),
        memory.index_of(ptr + spawn_result::TID_OR_ERRNO_OFFSET),
    ) else {
        return false;
    };
    match result {
        Ok(tid) => {
            memory.store(is_error, 0);
            memory.store(value, *tid as i32);
        }
        Err(e) => {
            memory.store(is_error, 1);
            memory.store(value, e.errno());
        }
    }
    memory.notify(value, usize::MAX);
    true
}

#[cfg(test)]
mod tests {
    use threadbridge_common::constants::errno;

    use super::*;

    #[test]
    fn result_record_layout() {
        let memory = SharedMemory::new_shared(64);
        assert!(write_spawn_result(&memory, 16, &Ok(43)));
        assert_eq!(memory.load(4), 0);
        assert_eq!(memory.load(5), 43);
        assert!(write_spawn_result(
            &memory,
            24,
            &Err(SpawnError::PoolExhausted { size: 1 })
        ));
        assert_eq!(memory.load(6), 1);
        assert_eq!(memory.load(7), errno::EAGAIN);
        assert!(!write_spawn_result(&memory, 60, &Ok(43)));
        assert!(!write_spawn_result(&memory, 2, &Ok(43)));
    }

    #[test]
    fn dropped_request_fails_the_waiting_worker() {
        let (handle, mut rx) = crate::context::LoopHandle::channel();
        let worker = std::thread::spawn(move || {
            let bridge = ThreadSpawnBridge::worker(
                MainPort::new(handle, std::sync::Weak::new()),
                SharedMemory::new_shared(64),
            );
            bridge.spawn(1)
        });
        // the main loop goes away without running the request
        let request = rx.blocking_recv().unwrap();
        drop(request);
        drop(rx);
        let result = worker.join().unwrap();
        assert!(matches!(result, Err(SpawnError::Rejected(errno::EAGAIN))));
    }

    #[test]
    fn answered_reply_is_not_overwritten() {
        let record = SharedMemory::new_shared(spawn_result::SIZE);
        SpawnReply::new(record.clone()).answer(&Ok(44));
        assert_eq!(record.load(0), 0);
        assert_eq!(record.load(1), 44);
    }

    #[test]
    fn unshared_memory_rejects_spawn() {
        let (handle, _rx) = crate::context::LoopHandle::channel();
        let bridge = ThreadSpawnBridge::worker(
            MainPort::new(handle, std::sync::Weak::new()),
            SharedMemory::new(64, false),
        );
        assert!(!bridge.is_main());
        assert!(matches!(bridge.spawn(1), Err(SpawnError::MemoryNotShared)));
        assert_eq!(bridge.thread_spawn(1), -errno::EAGAIN);
        assert_eq!(bridge.thread_spawn_with_result(1, 3), 1);
        assert_eq!(bridge.thread_spawn_with_result(1, 8), 0);
    }
}
