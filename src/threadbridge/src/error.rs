/*!
Error types for the runtime.

Every fallible operation reports an [`Error`], and every [`Error`] maps onto
the numeric [`Status`] a native addon would see through
[`Error::status`]. Thread creation has its own [`SpawnError`] so that callers
can tell capacity problems from timeouts and from startup failures.
*/

use std::any::Any;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use threadbridge_common::constants::errno;
use threadbridge_common::{decode_exception, encode_exception};

/// Numeric status codes, numbered as in `js_native_api_types.h`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Status {
    Ok = 0,
    InvalidArg = 1,
    ObjectExpected = 2,
    StringExpected = 3,
    NameExpected = 4,
    FunctionExpected = 5,
    NumberExpected = 6,
    BooleanExpected = 7,
    ArrayExpected = 8,
    GenericFailure = 9,
    PendingException = 10,
    Cancelled = 11,
    EscapeCalledTwice = 12,
    HandleScopeMismatch = 13,
    CallbackScopeMismatch = 14,
    QueueFull = 15,
    Closing = 16,
    BigintExpected = 17,
    DateExpected = 18,
    ArraybufferExpected = 19,
    DetachableArraybufferExpected = 20,
    WouldDeadlock = 21,
    NoExternalBuffersAllowed = 22,
    CannotRunJs = 23,
}

impl Status {
    /// The raw status code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Label used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::InvalidArg => "invalid_arg",
            Status::ObjectExpected => "object_expected",
            Status::StringExpected => "string_expected",
            Status::NameExpected => "name_expected",
            Status::FunctionExpected => "function_expected",
            Status::NumberExpected => "number_expected",
            Status::BooleanExpected => "boolean_expected",
            Status::ArrayExpected => "array_expected",
            Status::GenericFailure => "generic_failure",
            Status::PendingException => "pending_exception",
            Status::Cancelled => "cancelled",
            Status::EscapeCalledTwice => "escape_called_twice",
            Status::HandleScopeMismatch => "handle_scope_mismatch",
            Status::CallbackScopeMismatch => "callback_scope_mismatch",
            Status::QueueFull => "queue_full",
            Status::Closing => "closing",
            Status::BigintExpected => "bigint_expected",
            Status::DateExpected => "date_expected",
            Status::ArraybufferExpected => "arraybuffer_expected",
            Status::DetachableArraybufferExpected => "detachable_arraybuffer_expected",
            Status::WouldDeadlock => "would_deadlock",
            Status::NoExternalBuffersAllowed => "no_external_buffers_allowed",
            Status::CannotRunJs => "cannot_run_js",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A thrown value, reduced to the parts that survive a thread hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    /// Constructor name, e.g. `Error`.
    pub name: String,
    /// Message text.
    pub message: String,
    /// Stack trace, when one was captured.
    pub stack: Option<String>,
}

impl Exception {
    /// An `Error` with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_name("Error", message)
    }

    /// An exception with an explicit constructor name.
    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Build an exception from an embedder error, keeping its context chain.
    pub fn from_error(error: &anyhow::Error) -> Self {
        Self::new(format!("{error:#}"))
    }

    /// Build an exception from a caught panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::with_name("RuntimeError", message)
    }

    /// Frame the exception into `out`, returning the number of bytes used.
    pub fn encode_into(&self, out: &mut [u8]) -> Option<usize> {
        encode_exception(&self.name, &self.message, self.stack.as_deref(), out).ok()
    }

    /// Read back an exception framed by [`Exception::encode_into`].
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let decoded = decode_exception(frame).ok()?;
        Some(Self {
            name: decoded.name,
            message: decoded.message,
            stack: decoded.stack,
        })
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// A failure raised by module code running on a thread.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum GuestError {
    /// The module trapped. Shared memory may be inconsistent, so every thread
    /// is torn down.
    #[error("wasm trap: {0}")]
    Trap(String),
    /// The module threw and nothing caught it.
    #[error("uncaught exception: {0}")]
    Exception(Exception),
}

impl GuestError {
    /// Whether this error is a trap.
    pub fn is_trap(&self) -> bool {
        matches!(self, GuestError::Trap(_))
    }

    /// The error as an exception value.
    pub fn to_exception(&self) -> Exception {
        match self {
            GuestError::Trap(message) => Exception::with_name("RuntimeError", message.clone()),
            GuestError::Exception(e) => e.clone(),
        }
    }
}

/// Reasons thread creation can fail.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// Threads need a memory created as shared.
    #[error("module memory is not shared, threads are unavailable")]
    MemoryNotShared,
    /// A strict pool has no idle worker left.
    #[error("worker pool exhausted: all {size} workers are running")]
    PoolExhausted {
        /// Pool size.
        size: usize,
    },
    /// The new thread did not acknowledge startup in time.
    #[error("thread did not start within {0:?}")]
    TimedOut(Duration),
    /// The new thread reported an error before running module code.
    #[error("thread failed to start: {0}")]
    Startup(Exception),
    /// The worker factory could not create a worker.
    #[error("failed to create worker")]
    WorkerCreation(#[source] anyhow::Error),
    /// The worker went away before it could be used.
    #[error("worker is gone")]
    WorkerGone,
    /// The main thread answered a forwarded spawn request with an errno.
    #[error("thread spawn rejected with errno {0}")]
    Rejected(i32),
}

impl SpawnError {
    /// WASI errno reported through the raw ABI.
    pub fn errno(&self) -> i32 {
        match self {
            SpawnError::Rejected(code) => *code,
            _ => errno::EAGAIN,
        }
    }

    /// Whether the failure is a capacity limit.
    pub fn is_capacity(&self) -> bool {
        matches!(self, SpawnError::PoolExhausted { .. })
    }

    /// Whether the failure is a startup timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SpawnError::TimedOut(_))
    }

    /// Whether trying again later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpawnError::PoolExhausted { .. } | SpawnError::TimedOut(_) | SpawnError::Rejected(_)
        )
    }

    /// Label used for the spawn failure metric.
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            SpawnError::MemoryNotShared => "memory_not_shared",
            SpawnError::PoolExhausted { .. } => "pool_exhausted",
            SpawnError::TimedOut(_) => "timed_out",
            SpawnError::Startup(_) => "startup",
            SpawnError::WorkerCreation(_) => "worker_creation",
            SpawnError::WorkerGone => "worker_gone",
            SpawnError::Rejected(_) => "rejected",
        }
    }
}

/// The error type for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument was null, out of range or of the wrong kind.
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    /// An object was expected.
    #[error("object expected")]
    ObjectExpected,
    /// A function was expected.
    #[error("function expected")]
    FunctionExpected,
    /// A string was expected.
    #[error("string expected")]
    StringExpected,
    /// A number was expected.
    #[error("number expected")]
    NumberExpected,
    /// A boolean was expected.
    #[error("boolean expected")]
    BooleanExpected,
    /// Catch-all failure.
    #[error("{0}")]
    GenericFailure(String),
    /// Module code threw and the exception is still pending.
    #[error("exception pending: {0}")]
    PendingException(Exception),
    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// `escape_handle` was called twice on the same scope.
    #[error("escape called twice on the same handle scope")]
    EscapeCalledTwice,
    /// A scope was closed out of order.
    #[error("handle scope closed out of order")]
    HandleScopeMismatch,
    /// A non-blocking call found the queue full.
    #[error("threadsafe function queue is full")]
    QueueFull,
    /// The threadsafe function is closing.
    #[error("threadsafe function is closing")]
    Closing,
    /// A blocking call on the owner thread would never be drained.
    #[error("blocking call would deadlock the owner thread")]
    WouldDeadlock,
    /// A handle outlived its scope.
    #[error("handle {0} refers to a disposed scope")]
    DisposedHandle(u32),
    /// The environment hit a fatal error earlier and rejects further calls.
    #[error("environment is poisoned by an earlier fatal error")]
    Poisoned,
    /// A protocol violation that leaves the environment unusable.
    #[error("fatal error in {location}: {message}")]
    Fatal {
        /// Where the violation was detected.
        location: &'static str,
        /// What went wrong.
        message: String,
    },
    /// The environment is being torn down.
    #[error("cannot run module code while the environment is shutting down")]
    CannotRunJs,
    /// The target event loop is gone.
    #[error("event loop is closed")]
    LoopClosed,
    /// Thread creation failed.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Module code trapped or threw outside any environment.
    #[error(transparent)]
    Guest(#[from] GuestError),
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The configuration could not be parsed.
    #[error("failed to parse configuration")]
    Json(#[from] serde_json::Error),
    /// An OS resource could not be created.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// An embedder hook failed.
    #[error(transparent)]
    Embedder(#[from] anyhow::Error),
}

impl Error {
    /// The status code a native caller would observe.
    pub fn status(&self) -> Status {
        match self {
            Error::InvalidArg(_) | Error::DisposedHandle(_) | Error::Config(_) | Error::Json(_) => {
                Status::InvalidArg
            }
            Error::ObjectExpected => Status::ObjectExpected,
            Error::FunctionExpected => Status::FunctionExpected,
            Error::StringExpected => Status::StringExpected,
            Error::NumberExpected => Status::NumberExpected,
            Error::BooleanExpected => Status::BooleanExpected,
            Error::PendingException(_) | Error::Guest(GuestError::Exception(_)) => {
                Status::PendingException
            }
            Error::Cancelled => Status::Cancelled,
            Error::EscapeCalledTwice => Status::EscapeCalledTwice,
            Error::HandleScopeMismatch => Status::HandleScopeMismatch,
            Error::QueueFull => Status::QueueFull,
            Error::Closing => Status::Closing,
            Error::WouldDeadlock => Status::WouldDeadlock,
            Error::CannotRunJs | Error::Poisoned => Status::CannotRunJs,
            Error::GenericFailure(_)
            | Error::Fatal { .. }
            | Error::LoopClosed
            | Error::Spawn(_)
            | Error::Guest(GuestError::Trap(_))
            | Error::Io(_)
            | Error::Embedder(_) => Status::GenericFailure,
        }
    }

    /// Shorthand for [`Error::InvalidArg`].
    pub(crate) fn invalid_arg(what: impl Into<String>) -> Self {
        Error::InvalidArg(what.into())
    }

    /// Turn the error into the exception module code would observe.
    pub fn to_exception(&self) -> Exception {
        match self {
            Error::PendingException(e) => e.clone(),
            Error::Guest(e) => e.to_exception(),
            Error::InvalidArg(_)
            | Error::ObjectExpected
            | Error::FunctionExpected
            | Error::StringExpected
            | Error::NumberExpected
            | Error::BooleanExpected => Exception::with_name("TypeError", self.to_string()),
            _ => Exception::new(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_native_numbering() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::Cancelled.code(), 11);
        assert_eq!(Status::EscapeCalledTwice.code(), 12);
        assert_eq!(Status::HandleScopeMismatch.code(), 13);
        assert_eq!(Status::QueueFull.code(), 15);
        assert_eq!(Status::Closing.code(), 16);
        assert_eq!(Status::WouldDeadlock.code(), 21);
        assert_eq!(Status::CannotRunJs.code(), 23);
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(Error::QueueFull.status(), Status::QueueFull);
        assert_eq!(Error::DisposedHandle(9).status(), Status::InvalidArg);
        assert_eq!(
            Error::from(SpawnError::WorkerGone).status(),
            Status::GenericFailure
        );
    }

    #[test]
    fn spawn_error_classification() {
        let full = SpawnError::PoolExhausted { size: 2 };
        assert!(full.is_capacity() && !full.is_timeout());
        assert_eq!(full.errno(), errno::EAGAIN);
        let slow = SpawnError::TimedOut(Duration::from_millis(50));
        assert!(slow.is_timeout() && slow.is_retryable());
        assert!(!SpawnError::MemoryNotShared.is_retryable());
    }

    #[test]
    fn exception_survives_framing() {
        let exc = Exception::with_name("RangeError", "too far").with_stack("at f (x.wasm)");
        let mut buf = [0u8; 128];
        let used = exc.encode_into(&mut buf).unwrap();
        assert_eq!(Exception::decode(&buf[..used]), Some(exc));
    }

    #[test]
    fn panic_payloads_become_exceptions() {
        let exc = Exception::from_panic(&"kaboom");
        assert_eq!(exc.message, "kaboom");
        let exc = Exception::from_panic(&String::from("owned"));
        assert_eq!(exc.message, "owned");
    }
}
