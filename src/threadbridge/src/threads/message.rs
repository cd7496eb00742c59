use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::spawn::SpawnReply;
use super::worker::WorkerId;
use crate::error::GuestError;
use crate::memory::{Handshake, SharedMemory};
use crate::module::WasmModule;

/// Kinds of messages crossing thread boundaries, as they appear in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Main to worker: instantiate the module.
    Load,
    /// Worker to main: the module is instantiated.
    Loaded,
    /// Main to worker: run `wasi_thread_start`.
    Start,
    /// Worker to main: the thread finished.
    CleanupThread,
    /// Worker to main: please spawn a thread for me.
    SpawnThread,
    /// Worker to main: tear every thread down.
    TerminateAllThreads,
    /// Wake-up or deferred work on a loop.
    AsyncSend,
    /// A threadsafe function dispatch pass.
    TsfnSend,
    /// Async work handed to a scheduler.
    AsyncWorkQueue,
    /// Async work executing.
    Execute,
    /// Async work completion.
    Complete,
    /// Async work cancelled.
    Cancel,
    /// Worker to main: uncaught error or trap.
    Error,
}

impl MessageType {
    /// The wire name, e.g. `cleanup-thread`.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Load => "load",
            MessageType::Loaded => "loaded",
            MessageType::Start => "start",
            MessageType::CleanupThread => "cleanup-thread",
            MessageType::SpawnThread => "spawn-thread",
            MessageType::TerminateAllThreads => "terminate-all-threads",
            MessageType::AsyncSend => "async-send",
            MessageType::TsfnSend => "tsfn-send",
            MessageType::AsyncWorkQueue => "async-work-queue",
            MessageType::Execute => "execute",
            MessageType::Complete => "complete",
            MessageType::Cancel => "cancel",
            MessageType::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control messages between the main thread and workers.
pub(crate) enum Envelope {
    Load {
        module: Arc<dyn WasmModule>,
        memory: SharedMemory,
        handshake: Option<Handshake>,
    },
    Loaded {
        worker: WorkerId,
    },
    Start {
        tid: u32,
        arg: u32,
        handshake: Option<Handshake>,
    },
    CleanupThread {
        worker: WorkerId,
        tid: u32,
    },
    SpawnThread {
        arg: u32,
        reply: SpawnReply,
    },
    TerminateAllThreads,
    Error {
        worker: WorkerId,
        tid: Option<u32>,
        error: GuestError,
    },
    /// Stop the worker's message loop.
    Terminate,
}

impl Envelope {
    pub(crate) fn message_type(&self) -> MessageType {
        match self {
            Envelope::Load { .. } => MessageType::Load,
            Envelope::Loaded { .. } => MessageType::Loaded,
            Envelope::Start { .. } => MessageType::Start,
            Envelope::CleanupThread { .. } => MessageType::CleanupThread,
            Envelope::SpawnThread { .. } => MessageType::SpawnThread,
            Envelope::TerminateAllThreads | Envelope::Terminate => {
                MessageType::TerminateAllThreads
            }
            Envelope::Error { .. } => MessageType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_types_serialize_kebab_case() {
        for kind in [
            MessageType::CleanupThread,
            MessageType::TerminateAllThreads,
            MessageType::TsfnSend,
            MessageType::AsyncWorkQueue,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: MessageType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }
}
