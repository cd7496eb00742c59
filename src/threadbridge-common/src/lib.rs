//! Constants and binary layouts shared between the threadbridge runtime and
//! the modules it hosts.
//!
//! Everything here describes bytes that cross a thread boundary through shared
//! memory, so nothing in this crate allocates except the exception decoder.
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

/// Well-known numeric constants: reserved handle ids, thread id range, errno.
pub mod constants;
/// Length-prefixed exception framing used by the spawn handshake.
pub mod exception;
/// Fixed offsets of the records written into shared memory.
pub mod layout;

pub use exception::{DecodedException, FrameError, decode_exception, encode_exception};
