use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{Level, instrument};

use super::Context;
use crate::threads::MessageType;
use crate::{Error, Result};

/// Work delivered to a thread's event loop from any thread.
pub type Task = Box<dyn FnOnce(&Context) + Send + 'static>;

/// Work deferred to the next turn of the current thread's loop.
pub(crate) type LocalTask = Box<dyn FnOnce(&Context) + 'static>;

pub(crate) struct Posted {
    pub(crate) kind: MessageType,
    pub(crate) task: Task,
}

/// A sendable handle to one thread's event loop.
///
/// Posting is the only way another thread can make code run on the loop's
/// thread. The handle also carries the loop's keep-alive count: while it is
/// non-zero [`Context::run`] keeps waiting for tasks.
#[derive(Clone)]
pub struct LoopHandle {
    tx: UnboundedSender<Posted>,
    refs: Arc<AtomicUsize>,
    owner: ThreadId,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("owner", &self.owner)
            .field("refs", &self.active_refs())
            .finish()
    }
}

impl LoopHandle {
    pub(crate) fn channel() -> (Self, UnboundedReceiver<Posted>) {
        let (tx, rx) = unbounded_channel();
        let handle = Self {
            tx,
            refs: Arc::new(AtomicUsize::new(0)),
            owner: std::thread::current().id(),
        };
        (handle, rx)
    }

    /// Queue `task` on the owning loop.
    pub fn post(
        &self,
        kind: MessageType,
        task: impl FnOnce(&Context) + Send + 'static,
    ) -> Result<()> {
        self.tx
            .send(Posted {
                kind,
                task: Box::new(task),
            })
            .map_err(|_| Error::LoopClosed)
    }

    /// Whether the calling thread runs this loop.
    pub fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    /// Keep the loop alive until a matching [`unref_loop`](Self::unref_loop).
    #[instrument(skip_all, level=Level::TRACE)]
    pub fn ref_loop(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one keep-alive reference.
    #[instrument(skip_all, level=Level::TRACE)]
    pub fn unref_loop(&self) {
        let prev = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev == Ok(1) && !self.is_owner_thread() {
            // wake a loop parked in `run` so it can notice it may exit
            let _ = self.post(MessageType::AsyncSend, |_| {});
        }
    }

    /// Current keep-alive count.
    pub fn active_refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}
