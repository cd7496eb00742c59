/// Handshake buffer shared between a spawning thread and the worker it starts.
///
/// ```text
/// +--------+--------+-------------+----------+----------------------+
/// | status |  tid   | payload_len | reserved | payload (8192 bytes) |
/// |  i32   |  i32   |     i32     |   i32    |   framed exception   |
/// +--------+--------+-------------+----------+----------------------+
/// ```
pub mod handshake {
    /// Size of the header in bytes.
    pub const HEADER_SIZE: usize = 16;
    /// Size of the exception payload area in bytes.
    pub const PAYLOAD_SIZE: usize = 8192;
    /// Total size of the buffer in bytes.
    pub const SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;
    /// Word index of the status, see [`crate::constants::handshake`].
    pub const STATUS_INDEX: usize = 0;
    /// Word index of the thread id the worker was started with.
    pub const TID_INDEX: usize = 1;
    /// Word index of the number of payload bytes written.
    pub const PAYLOAD_LEN_INDEX: usize = 2;
    /// Byte offset of the payload.
    pub const PAYLOAD_OFFSET: usize = HEADER_SIZE;
}

/// Result record written by `thread_spawn_with_result`.
///
/// Waiters block on the second word, which is never zero once written.
pub mod spawn_result {
    /// Byte offset of `is_error` (`0` or `1`).
    pub const IS_ERROR_OFFSET: usize = 0;
    /// Byte offset of the thread id, or the errno when `is_error` is set.
    pub const TID_OR_ERRNO_OFFSET: usize = 4;
    /// Size of the record in bytes.
    pub const SIZE: usize = 8;
    /// Required alignment of the record.
    pub const ALIGN: usize = 4;
}

/// Diagnostic snapshot of a threadsafe function, little endian.
pub mod tsfn {
    /// `u32` remaining producer count.
    pub const THREAD_COUNT_OFFSET: usize = 0;
    /// `u32` boolean.
    pub const IS_CLOSING_OFFSET: usize = 4;
    /// `u32` boolean.
    pub const HANDLES_CLOSING_OFFSET: usize = 8;
    /// `u32` dispatch state bits.
    pub const DISPATCH_STATE_OFFSET: usize = 12;
    /// `u32` queue capacity, `0` for unbounded.
    pub const MAX_QUEUE_SIZE_OFFSET: usize = 16;
    /// `u32` items waiting in the queue.
    pub const QUEUE_LEN_OFFSET: usize = 20;
    /// `u64` async id.
    pub const ASYNC_ID_OFFSET: usize = 24;
    /// `u64` trigger async id.
    pub const TRIGGER_ASYNC_ID_OFFSET: usize = 32;
    /// `u32` id of the owning environment.
    pub const ENV_ID_OFFSET: usize = 40;
    /// Size of the record in bytes.
    pub const SIZE: usize = 48;

    /// No dispatch pass is running or scheduled.
    pub const DISPATCH_IDLE: u8 = 0;
    /// A dispatch pass is executing on the owner thread.
    pub const DISPATCH_RUNNING: u8 = 1 << 0;
    /// A dispatch pass has been requested.
    pub const DISPATCH_PENDING: u8 = 1 << 1;
}
