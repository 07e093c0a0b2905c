//! Remote terminal protocols.
//!
//! Two framings share one connection model: the host mirrors every window it
//! owns (a computer's terminal plus any monitors) to a detached client, and
//! the client sends input back for a window id.
//!
//! ```text
//!  Screen ──► RawHost::render ──► "!CPC…\n" ──► client ──► WindowMirror
//!                                                  │
//!  ComputerRegistry ◄── dispatch_input ◄── read_input ◄─┘  key/mouse/event/resize
//! ```
//!
//! - [`raw`]: base64 frames with a CRC32 trailer, carrying full screen
//!   snapshots and typed input.
//! - [`line`]: `CODE:window;payload` text lines for window lifecycle and
//!   messages.

pub mod line;
pub mod mirror;
pub mod raw;
pub mod session;

use thiserror::Error;

pub use mirror::WindowMirror;
pub use raw::{Frame, FrameCodec, Message};
pub use session::{LineHost, RawHost, RemoteHost, RemoteInput, dispatch_input, read_input};

/// Longest line accepted from a client before the stream counts as desynced.
pub const MAX_LINE: usize = 1_048_576;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("checksum mismatch: frame carries {expected:08x}, payload hashes to {actual:08x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("bad frame header: {0}")]
    Header(String),

    #[error("frame payload truncated")]
    Truncated,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unknown frame type {0}")]
    UnknownType(u8),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("value cannot be encoded: {0}")]
    Unencodable(String),

    #[error("input line exceeds {MAX_LINE} bytes")]
    Desync,

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the stream can no longer be trusted to be frame-aligned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Desync | ProtocolError::Io(_))
    }
}
