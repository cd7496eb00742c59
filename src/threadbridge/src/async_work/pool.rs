use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::{Level, instrument};

use super::{AsyncWorkScheduler, Job, JobKey, WorkState, deliver_completion};
use crate::context::Context;
use crate::error::Status;
use crate::threads::MessageType;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    idle: usize,
    running: usize,
    spawned: usize,
    shutdown: bool,
    threads: Vec<JoinHandle<()>>,
}

struct PoolShared {
    size: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A fixed set of pool threads pulling from one FIFO queue.
///
/// Threads are spawned on demand up to `size`. A job is claimed and marked
/// running under the queue lock, so a concurrent cancel either removes it
/// from the queue or finds it gone.
pub(crate) struct WorkerPoolScheduler {
    shared: Arc<PoolShared>,
}

impl WorkerPoolScheduler {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                size: size.max(1),
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Jobs currently executing.
    #[cfg(test)]
    fn running(&self) -> usize {
        self.shared.lock().running
    }
}

fn post_completion(job: &Job, status: Status) -> bool {
    let key = job.key;
    let posted = job
        .owner
        .post(MessageType::Complete, move |ctx| {
            deliver_completion(ctx, key, status)
        })
        .is_ok();
    if !posted {
        tracing::warn!(
            env = key.env,
            work = key.work,
            "Owner loop closed, async work completion dropped"
        );
    }
    posted
}

#[instrument(skip_all, level=Level::DEBUG)]
fn worker_main(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    if job.start() {
                        state.running += 1;
                        break Some(job);
                    }
                    continue;
                }
                if state.shutdown {
                    break None;
                }
                state.idle += 1;
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
                state.idle -= 1;
            }
        };
        let Some(job) = job else {
            return;
        };
        let status = job.run();
        shared.lock().running -= 1;
        post_completion(&job, status);
    }
}

impl AsyncWorkScheduler for WorkerPoolScheduler {
    fn queue(&self, _ctx: &Context, job: Job) {
        let mut state = self.shared.lock();
        if state.shutdown {
            drop(state);
            tracing::warn!(env = job.key.env, work = job.key.work, "Async work pool is shut down");
            job.state.store(WorkState::Cancelled as u8, Ordering::SeqCst);
            // the completion releases the loop ref taken when it was queued
            if !post_completion(&job, Status::Cancelled) {
                job.owner.unref_loop();
            }
            return;
        }
        state.queue.push_back(job);
        if state.idle > 0 || state.spawned >= self.shared.size {
            self.shared.available.notify_one();
            return;
        }
        let index = state.spawned;
        let shared = self.shared.clone();
        match std::thread::Builder::new()
            .name(format!("threadbridge-async-{index}"))
            .spawn(move || worker_main(shared))
        {
            Ok(handle) => {
                state.spawned += 1;
                state.threads.push(handle);
                tracing::debug!(index, size = self.shared.size, "Spawned async work thread");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn async work thread");
                if state.spawned == 0 {
                    // nothing will ever pick these up
                    for job in state.queue.drain(..) {
                        if job.start() && !post_completion(&job, Status::GenericFailure) {
                            job.owner.unref_loop();
                        }
                    }
                }
            }
        }
    }

    fn cancel(&self, key: JobKey) -> bool {
        let mut state = self.shared.lock();
        match state.queue.iter().position(|job| job.key == key) {
            Some(pos) => {
                state.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    #[instrument(skip_all, level=Level::DEBUG)]
    fn shutdown(&self) {
        let threads = {
            let mut state = self.shared.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let dropped = state.queue.len();
            if dropped > 0 {
                tracing::debug!(dropped, "Dropping queued async work");
            }
            state.queue.clear();
            self.shared.available.notify_all();
            std::mem::take(&mut state.threads)
        };
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() != current && handle.join().is_err() {
                tracing::error!("Async work thread panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "worker_pool"
    }
}

impl Drop for WorkerPoolScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
