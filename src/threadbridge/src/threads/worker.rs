use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{Level, instrument};

use super::manager::ThreadManager;
use super::message::Envelope;
use super::spawn::ThreadSpawnBridge;
use crate::config::RuntimeConfig;
use crate::context::{Context, LoopHandle};
use crate::error::{Exception, GuestError};
use crate::memory::{Handshake, SharedMemory};
use crate::module::{Instance, ThreadContext};

/// Identity of a worker for the lifetime of its [`ThreadManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub(crate) u32);

impl WorkerId {
    /// The raw id.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// The way back from a worker to the main thread's manager.
#[derive(Clone)]
pub(crate) struct MainPort {
    handle: LoopHandle,
    manager: Weak<ThreadManager>,
}

impl MainPort {
    pub(crate) fn new(handle: LoopHandle, manager: Weak<ThreadManager>) -> Self {
        Self { handle, manager }
    }

    /// Deliver `envelope` to the manager on the main loop.
    pub(crate) fn send(&self, envelope: Envelope) -> bool {
        let manager = self.manager.clone();
        let kind = envelope.message_type();
        self.handle
            .post(kind, move |_| {
                if let Some(manager) = manager.upgrade() {
                    manager.handle_message(envelope);
                }
            })
            .is_ok()
    }
}

/// Everything a worker needs to run.
pub struct WorkerOptions {
    id: WorkerId,
    name: String,
    main: MainPort,
    config: Arc<RuntimeConfig>,
}

impl WorkerOptions {
    pub(crate) fn new(id: WorkerId, main: MainPort, config: Arc<RuntimeConfig>) -> Self {
        Self {
            id,
            name: format!("threadbridge-{id}"),
            main,
            config,
        }
    }

    /// The worker's id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Suggested OS thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The main thread's end of a worker's inbox.
pub(crate) struct WorkerPort {
    inbox: UnboundedSender<Envelope>,
    terminated: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// A worker's incoming messages.
pub struct WorkerInbox {
    rx: UnboundedReceiver<Envelope>,
    terminated: Arc<AtomicBool>,
}

impl WorkerPort {
    pub(crate) fn channel() -> (WorkerPort, WorkerInbox) {
        let (tx, rx) = unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));
        (
            WorkerPort {
                inbox: tx,
                terminated: terminated.clone(),
                join: Mutex::new(None),
            },
            WorkerInbox { rx, terminated },
        )
    }

    pub(crate) fn set_join_handle(&self, handle: Option<JoinHandle<()>>) {
        *self.join.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    pub(crate) fn post(&self, envelope: Envelope) -> bool {
        !self.is_terminated() && self.inbox.send(envelope).is_ok()
    }

    /// Ask the worker to stop. A worker busy in module code stops once that
    /// code returns; its thread is detached, never joined.
    pub(crate) fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inbox.send(Envelope::Terminate);
        let handle = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(handle);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl WorkerInbox {
    /// Block until the next message. `None` once the worker is terminated.
    pub(crate) fn recv(&mut self) -> Option<Envelope> {
        if self.terminated.load(Ordering::SeqCst) {
            return None;
        }
        match self.rx.blocking_recv()? {
            Envelope::Terminate => None,
            envelope => Some(envelope),
        }
    }

    /// Whether the main thread terminated this worker.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// The default worker message loop. Returns when the worker is
    /// terminated or the manager goes away.
    #[instrument(skip_all, fields(worker = %options.id), level=Level::DEBUG)]
    pub fn run(mut self, options: WorkerOptions) {
        let mut loaded: Option<Instance> = None;
        while let Some(envelope) = self.recv() {
            match envelope {
                Envelope::Load {
                    module,
                    memory,
                    handshake,
                } => match module.instantiate(&memory) {
                    Ok(instance) => {
                        loaded = Some(instance);
                        options.main.send(Envelope::Loaded { worker: options.id });
                    }
                    Err(e) => {
                        let exception = Exception::from_error(&e);
                        tracing::error!(worker = %options.id, %exception, "Failed to instantiate module");
                        report_failure(&options, None, handshake.as_ref(), exception);
                    }
                },
                Envelope::Start {
                    tid,
                    arg,
                    handshake,
                } => match loaded.as_mut() {
                    Some(instance) => {
                        run_thread(&options, instance, tid, arg, handshake.as_ref())
                    }
                    None => report_failure(
                        &options,
                        Some(tid),
                        handshake.as_ref(),
                        Exception::new("thread started before the module was loaded"),
                    ),
                },
                other => {
                    tracing::warn!(
                        worker = %options.id,
                        kind = %other.message_type(),
                        "Unexpected message on worker"
                    );
                }
            }
        }
        tracing::debug!(worker = %options.id, "Worker exiting");
    }
}

fn report_failure(
    options: &WorkerOptions,
    tid: Option<u32>,
    handshake: Option<&Handshake>,
    exception: Exception,
) {
    if let Some(handshake) = handshake {
        handshake.set_error(&exception);
    }
    options.main.send(Envelope::Error {
        worker: options.id,
        tid,
        error: GuestError::Exception(exception),
    });
}

#[instrument(skip_all, fields(tid = tid), level=Level::DEBUG)]
fn run_thread(
    options: &WorkerOptions,
    instance: &mut Instance,
    tid: u32,
    arg: u32,
    handshake: Option<&Handshake>,
) {
    let context = match Context::new(options.config.clone()) {
        Ok(context) => context,
        Err(e) => {
            report_failure(options, Some(tid), handshake, e.to_exception());
            return;
        }
    };
    let memory: SharedMemory = instance.memory.clone();
    let Some(thread_start) = instance.wasi_thread_start.as_mut() else {
        report_failure(
            options,
            Some(tid),
            handshake,
            Exception::new("module does not export wasi_thread_start"),
        );
        return;
    };
    let spawner = ThreadSpawnBridge::worker(options.main.clone(), memory.clone());
    if let Some(handshake) = handshake {
        handshake.set_started(tid);
    }
    tracing::debug!(worker = %options.id, tid, "Thread started");

    let thread = ThreadContext::new(&context, &spawner, &memory, tid);
    let result = catch_unwind(AssertUnwindSafe(|| thread_start(&thread, tid, arg)))
        .unwrap_or_else(|payload| {
            Err(GuestError::Exception(Exception::from_panic(payload.as_ref())))
        });
    if result.is_ok() {
        context.run();
    }
    context.teardown();

    match result {
        Ok(()) => {
            options.main.send(Envelope::CleanupThread {
                worker: options.id,
                tid,
            });
        }
        Err(error) => {
            tracing::error!(worker = %options.id, tid, %error, "Thread failed");
            options.main.send(Envelope::Error {
                worker: options.id,
                tid: Some(tid),
                error,
            });
        }
    }
}

/// Creates the execution vehicle for each worker.
///
/// The factory must arrange for `inbox` to be driven, usually by calling
/// [`WorkerInbox::run`] on a new thread. A factory that never drives it
/// produces workers that never start, which the spawn timeout handles.
pub trait WorkerFactory: Send + Sync {
    /// Start a worker. The returned handle, if any, is detached when the
    /// worker is terminated.
    fn create_worker(
        &self,
        options: WorkerOptions,
        inbox: WorkerInbox,
    ) -> anyhow::Result<Option<JoinHandle<()>>>;
}

/// Runs each worker on a dedicated OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadWorkerFactory;

impl WorkerFactory for ThreadWorkerFactory {
    fn create_worker(
        &self,
        options: WorkerOptions,
        inbox: WorkerInbox,
    ) -> anyhow::Result<Option<JoinHandle<()>>> {
        let handle = std::thread::Builder::new()
            .name(options.name().to_string())
            .spawn(move || inbox.run(options))
            .with_context(|| "failed to spawn worker thread")?;
        Ok(Some(handle))
    }
}
