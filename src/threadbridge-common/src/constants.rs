/// Handle ids with a fixed meaning in every handle store.
pub mod handle {
    /// The null handle. Never refers to a value.
    pub const INVALID: u32 = 0;
    /// `undefined`.
    pub const UNDEFINED: u32 = 1;
    /// `null`.
    pub const NULL: u32 = 2;
    /// `false`.
    pub const FALSE: u32 = 3;
    /// `true`.
    pub const TRUE: u32 = 4;
    /// The global object.
    pub const GLOBAL: u32 = 5;
    /// First id handed out for dynamically created values.
    pub const MIN_ID: u32 = 6;
}

/// Thread id allocation.
///
/// Ids below [`OFFSET`](tid::OFFSET) are reserved for the main thread and for
/// ids handed out by the host libc, so worker ids cycle through
/// `OFFSET..=MAX`.
pub mod tid {
    /// Thread id used for the main thread.
    pub const MAIN: u32 = 0;
    /// Lowest id given to a worker thread.
    pub const OFFSET: u32 = 43;
    /// Highest id given to a worker thread.
    pub const MAX: u32 = 0x1FFF_FFFF;
    /// Number of distinct worker ids.
    pub const RANGE: u32 = MAX - OFFSET + 1;

    /// Map a monotonically increasing sequence number onto the id ring.
    pub const fn from_seq(seq: u32) -> u32 {
        OFFSET + seq % RANGE
    }

    /// Whether `tid` belongs to a worker thread.
    pub const fn is_worker(tid: u32) -> bool {
        tid >= OFFSET && tid <= MAX
    }
}

/// WASI errno values returned through the legacy spawn ABI.
pub mod errno {
    /// Resource temporarily unavailable.
    pub const EAGAIN: i32 = 6;
    /// Invalid argument.
    pub const EINVAL: i32 = 28;
    /// Not enough space.
    pub const ENOMEM: i32 = 48;
}

/// Values of the first word of a spawn handshake buffer.
pub mod handshake {
    /// The new thread has not reported yet.
    pub const WAITING: i32 = 0;
    /// `wasi_thread_start` is about to be entered.
    pub const STARTED: i32 = 1;
    /// Startup failed. The payload holds a framed exception.
    pub const FAILED: i32 = 2;

    /// Whether a status word means the thread failed to start.
    pub const fn is_error(status: i32) -> bool {
        status > STARTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_ring_wraps_into_reserved_range() {
        assert_eq!(tid::from_seq(0), 43);
        assert_eq!(tid::from_seq(tid::RANGE - 1), tid::MAX);
        assert_eq!(tid::from_seq(tid::RANGE), tid::OFFSET);
        assert!(!tid::is_worker(tid::MAIN));
        assert!(tid::is_worker(tid::MAX));
    }

    #[test]
    fn handshake_error_statuses() {
        assert!(!handshake::is_error(handshake::WAITING));
        assert!(!handshake::is_error(handshake::STARTED));
        assert!(handshake::is_error(handshake::FAILED));
        assert!(handshake::is_error(17));
    }
}
