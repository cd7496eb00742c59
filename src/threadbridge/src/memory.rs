//! Shared linear memory with `Atomics.wait` / `Atomics.notify` style
//! primitives.
//!
//! Memory is an array of 32-bit atomic words. Waiters park on a single
//! condition variable and re-check their word on every wake-up, so a notify
//! that races a waiter's check can never be lost: the notifier has to take the
//! futex lock, which the waiter holds from its check until it parks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use threadbridge_common::constants::handshake as status;
use threadbridge_common::layout::handshake as layout;

use crate::Exception;

/// Result of [`SharedMemory::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The word changed while waiting.
    Ok,
    /// The word already differed from `expected`.
    NotEqual,
    /// The timeout elapsed first.
    TimedOut,
}

struct MemoryInner {
    words: Box<[AtomicI32]>,
    shared: bool,
    // waiter count per word index
    futex: Mutex<HashMap<usize, usize>>,
    wake: Condvar,
}

/// A linear memory that can be handed to several threads.
#[derive(Clone)]
pub struct SharedMemory {
    inner: Arc<MemoryInner>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("bytes", &self.byte_len())
            .field("shared", &self.inner.shared)
            .finish()
    }
}

impl SharedMemory {
    /// Allocate zeroed memory of at least `bytes` bytes, rounded up to a word.
    pub fn new(bytes: usize, shared: bool) -> Self {
        let words = bytes.div_ceil(4);
        Self {
            inner: Arc::new(MemoryInner {
                words: (0..words).map(|_| AtomicI32::new(0)).collect(),
                shared,
                futex: Mutex::new(HashMap::new()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Allocate zeroed shared memory.
    pub fn new_shared(bytes: usize) -> Self {
        Self::new(bytes, true)
    }

    /// Whether the memory was created as shared.
    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.inner.words.len() * 4
    }

    /// Size in 32-bit words.
    pub fn word_len(&self) -> usize {
        self.inner.words.len()
    }

    /// Whether two handles refer to the same memory.
    pub fn same_as(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn word(&self, index: usize) -> &AtomicI32 {
        &self.inner.words[index]
    }

    /// Word index for a 4-byte aligned byte address, if it is in range.
    pub fn index_of(&self, addr: usize) -> Option<usize> {
        (addr % 4 == 0 && addr / 4 < self.word_len()).then_some(addr / 4)
    }

    /// `Atomics.load`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`word_len`](Self::word_len). Use
    /// [`index_of`](Self::index_of) to check untrusted addresses.
    pub fn load(&self, index: usize) -> i32 {
        self.word(index).load(Ordering::SeqCst)
    }

    /// `Atomics.store`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`word_len`](Self::word_len). Use
    /// [`index_of`](Self::index_of) to check untrusted addresses.
    pub fn store(&self, index: usize, value: i32) {
        self.word(index).store(value, Ordering::SeqCst)
    }

    /// `Atomics.add`, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`word_len`](Self::word_len). Use
    /// [`index_of`](Self::index_of) to check untrusted addresses.
    pub fn fetch_add(&self, index: usize, value: i32) -> i32 {
        self.word(index).fetch_add(value, Ordering::SeqCst)
    }

    /// `Atomics.compareExchange`, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`word_len`](Self::word_len). Use
    /// [`index_of`](Self::index_of) to check untrusted addresses.
    pub fn compare_exchange(&self, index: usize, expected: i32, value: i32) -> i32 {
        match self
            .word(index)
            .compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    fn lock_futex(&self) -> MutexGuard<'_, HashMap<usize, usize>> {
        self.inner
            .futex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park until word `index` no longer holds `expected`, or `timeout` passes.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`word_len`](Self::word_len). Use
    /// [`index_of`](Self::index_of) to check untrusted addresses.
    pub fn wait(&self, index: usize, expected: i32, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut waiters = self.lock_futex();
        if self.load(index) != expected {
            return WaitOutcome::NotEqual;
        }
        *waiters.entry(index).or_insert(0) += 1;
        let outcome = loop {
            if self.load(index) != expected {
                break WaitOutcome::Ok;
            }
            match deadline {
                None => {
                    waiters = self
                        .inner
                        .wake
                        .wait(waiters)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break WaitOutcome::TimedOut;
                    }
                    waiters = match self.inner.wake.wait_timeout(waiters, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        };
        if let Some(count) = waiters.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                waiters.remove(&index);
            }
        }
        outcome
    }

    /// Like [`wait`](Self::wait) but never parks the thread.
    ///
    /// Used on threads that must stay responsive, where the host forbids
    /// blocking waits.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range, like [`wait`](Self::wait).
    pub fn wait_spinning(
        &self,
        index: usize,
        expected: i32,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        if self.load(index) != expected {
            return WaitOutcome::NotEqual;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut spins = 0u32;
        loop {
            if self.load(index) != expected {
                return WaitOutcome::Ok;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return WaitOutcome::TimedOut;
            }
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// `Atomics.notify`: wake up to `count` waiters on word `index`.
    ///
    /// Returns the number of threads that were waiting on that word, capped
    /// at `count`.
    pub fn notify(&self, index: usize, count: usize) -> usize {
        let waiters = self.lock_futex();
        let waiting = waiters.get(&index).copied().unwrap_or(0);
        self.inner.wake.notify_all();
        waiting.min(count)
    }

    /// Copy bytes out of memory.
    ///
    /// # Panics
    ///
    /// Panics if `offset + len` runs past [`byte_len`](Self::byte_len).
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        (offset..offset + len)
            .map(|addr| self.load(addr / 4).to_le_bytes()[addr % 4])
            .collect()
    }

    /// Copy bytes into memory. Each touched word is updated atomically.
    ///
    /// # Panics
    ///
    /// Panics if `offset + bytes.len()` runs past [`byte_len`](Self::byte_len).
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let addr = offset + i;
            let shift = (addr % 4) * 8;
            let mask = !(0xFFi32.wrapping_shl(shift as u32));
            let _ = self
                .word(addr / 4)
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                    Some((w & mask) | ((*byte as i32) << shift))
                });
        }
    }
}

/// Outcome of waiting on a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandshakeOutcome {
    Started,
    Failed(Exception),
    TimedOut,
}

/// The buffer a spawning thread waits on while a worker starts up.
#[derive(Debug, Clone)]
pub(crate) struct Handshake {
    buf: SharedMemory,
}

impl Handshake {
    pub(crate) fn new() -> Self {
        Self {
            buf: SharedMemory::new_shared(layout::SIZE),
        }
    }

    pub(crate) fn status(&self) -> i32 {
        self.buf.load(layout::STATUS_INDEX)
    }

    /// Reported by the worker right before `wasi_thread_start` runs.
    pub(crate) fn set_started(&self, tid: u32) {
        self.buf.store(layout::TID_INDEX, tid as i32);
        self.buf.store(layout::STATUS_INDEX, status::STARTED);
        self.buf.notify(layout::STATUS_INDEX, 1);
    }

    /// Reported by the worker when it cannot start.
    pub(crate) fn set_error(&self, exception: &Exception) {
        let mut payload = vec![0u8; layout::PAYLOAD_SIZE];
        let used = exception.encode_into(&mut payload).unwrap_or(0);
        self.buf.write_bytes(layout::PAYLOAD_OFFSET, &payload[..used]);
        self.buf.store(layout::PAYLOAD_LEN_INDEX, used as i32);
        self.buf.store(layout::STATUS_INDEX, status::FAILED);
        self.buf.notify(layout::STATUS_INDEX, 1);
    }

    fn read_error(&self) -> Exception {
        let len = (self.buf.load(layout::PAYLOAD_LEN_INDEX).max(0) as usize)
            .min(layout::PAYLOAD_SIZE);
        let frame = self.buf.read_bytes(layout::PAYLOAD_OFFSET, len);
        Exception::decode(&frame)
            .unwrap_or_else(|| Exception::new("thread failed to start"))
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>, spin_only: bool) -> HandshakeOutcome {
        let outcome = if spin_only {
            self.buf
                .wait_spinning(layout::STATUS_INDEX, status::WAITING, timeout)
        } else {
            self.buf.wait(layout::STATUS_INDEX, status::WAITING, timeout)
        };
        match (outcome, self.status()) {
            (WaitOutcome::TimedOut, status::WAITING) => HandshakeOutcome::TimedOut,
            (_, s) if status::is_error(s) => HandshakeOutcome::Failed(self.read_error()),
            _ => HandshakeOutcome::Started,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn wait_returns_not_equal_immediately() {
        let mem = SharedMemory::new_shared(16);
        mem.store(1, 7);
        assert_eq!(mem.wait(1, 0, None), WaitOutcome::NotEqual);
    }

    #[test]
    fn wait_times_out() {
        let mem = SharedMemory::new_shared(16);
        let start = Instant::now();
        assert_eq!(
            mem.wait(0, 0, Some(Duration::from_millis(20))),
            WaitOutcome::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn notify_wakes_waiter_on_other_thread() {
        let mem = SharedMemory::new_shared(16);
        let remote = mem.clone();
        let waiter = thread::spawn(move || remote.wait(2, 0, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(10));
        mem.store(2, 1);
        mem.notify(2, 1);
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Ok);
    }

    #[test]
    fn spinning_wait_sees_store() {
        let mem = SharedMemory::new_shared(16);
        let remote = mem.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            remote.store(0, 3);
        });
        assert_eq!(
            mem.wait_spinning(0, 0, Some(Duration::from_secs(5))),
            WaitOutcome::Ok
        );
        writer.join().unwrap();
    }

    #[test]
    fn bytes_round_trip_unaligned() {
        let mem = SharedMemory::new_shared(32);
        mem.write_bytes(3, b"hello");
        assert_eq!(mem.read_bytes(3, 5), b"hello");
        assert_eq!(mem.read_bytes(2, 1), [0]);
    }

    #[test]
    fn index_of_checks_alignment_and_range() {
        let mem = SharedMemory::new_shared(8);
        assert_eq!(mem.index_of(4), Some(1));
        assert_eq!(mem.index_of(2), None);
        assert_eq!(mem.index_of(8), None);
    }

    #[test]
    #[should_panic]
    fn load_past_the_end_panics() {
        let mem = SharedMemory::new_shared(8);
        assert_eq!(mem.index_of(8), None);
        mem.load(2);
    }

    #[test]
    #[should_panic]
    fn read_past_the_end_panics() {
        SharedMemory::new_shared(8).read_bytes(6, 4);
    }

    #[test]
    fn handshake_reports_failure() {
        let hs = Handshake::new();
        let worker = hs.clone();
        thread::spawn(move || worker.set_error(&Exception::new("no module")));
        match hs.wait(Some(Duration::from_secs(5)), false) {
            HandshakeOutcome::Failed(exc) => assert_eq!(exc.message, "no module"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn handshake_times_out() {
        let hs = Handshake::new();
        assert_eq!(
            hs.wait(Some(Duration::from_millis(10)), true),
            HandshakeOutcome::TimedOut
        );
    }
}
