//! Framing for exceptions that have to cross a thread boundary as bytes.
//!
//! ```text
//! [name_len: u32][message_len: u32][stack_len: u32][name][message][stack]
//! ```
//!
//! All lengths are little endian byte counts of UTF-8 text. A `stack_len` of
//! `u32::MAX` means the exception carried no stack. Text that does not fit the
//! destination buffer is truncated on a character boundary, name first, then
//! message, then stack.

use alloc::string::String;
use core::fmt;

const HEADER: usize = 12;
const NO_STACK: u32 = u32::MAX;

/// Errors produced while framing or unframing an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer cannot hold even the header.
    BufferTooSmall,
    /// A length field points past the end of the buffer.
    Truncated,
    /// A text field is not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BufferTooSmall => f.write_str("buffer too small for exception header"),
            FrameError::Truncated => f.write_str("exception frame is truncated"),
            FrameError::InvalidUtf8 => f.write_str("exception frame is not valid utf-8"),
        }
    }
}

/// An exception read back from a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedException {
    /// Constructor name, e.g. `Error` or `RangeError`.
    pub name: String,
    /// Human readable message.
    pub message: String,
    /// Stack trace, if one was captured.
    pub stack: Option<String>,
}

fn clip(text: &str, room: usize) -> &str {
    if text.len() <= room {
        return text;
    }
    let mut end = room;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Write an exception into `out`, returning the number of bytes used.
pub fn encode_exception(
    name: &str,
    message: &str,
    stack: Option<&str>,
    out: &mut [u8],
) -> Result<usize, FrameError> {
    if out.len() < HEADER {
        return Err(FrameError::BufferTooSmall);
    }
    let mut room = out.len() - HEADER;
    let name = clip(name, room);
    room -= name.len();
    let message = clip(message, room);
    room -= message.len();
    let stack = stack.map(|s| clip(s, room));

    out[0..4].copy_from_slice(&(name.len() as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(message.len() as u32).to_le_bytes());
    let stack_len = stack.map_or(NO_STACK, |s| s.len() as u32);
    out[8..12].copy_from_slice(&stack_len.to_le_bytes());

    let mut at = HEADER;
    for part in [name, message, stack.unwrap_or("")] {
        out[at..at + part.len()].copy_from_slice(part.as_bytes());
        at += part.len();
    }
    Ok(at)
}

fn read_len(frame: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&frame[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_text(frame: &[u8], at: &mut usize, len: usize) -> Result<String, FrameError> {
    let end = at.checked_add(len).ok_or(FrameError::Truncated)?;
    let bytes = frame.get(*at..end).ok_or(FrameError::Truncated)?;
    *at = end;
    core::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|_| FrameError::InvalidUtf8)
}

/// Read an exception previously written by [`encode_exception`].
pub fn decode_exception(frame: &[u8]) -> Result<DecodedException, FrameError> {
    if frame.len() < HEADER {
        return Err(FrameError::BufferTooSmall);
    }
    let name_len = read_len(frame, 0) as usize;
    let message_len = read_len(frame, 4) as usize;
    let stack_len = read_len(frame, 8);

    let mut at = HEADER;
    let name = read_text(frame, &mut at, name_len)?;
    let message = read_text(frame, &mut at, message_len)?;
    let stack = if stack_len == NO_STACK {
        None
    } else {
        Some(read_text(frame, &mut at, stack_len as usize)?)
    };
    Ok(DecodedException {
        name,
        message,
        stack,
    })
}
