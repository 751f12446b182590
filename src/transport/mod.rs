//! Input transport (C2): a uniform capability set over three source kinds.
//!
//! Per the redesign note in the design doc, the branch-on-`readerType`
//! pattern from the original is replaced with a trait object per port.

mod compressed;
mod raw;
mod ring_buffer;

pub use compressed::CompressedTransport;
pub use raw::RawTransport;
pub use ring_buffer::RingBufferTransport;

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Which transport kind a port should use. Selected once at session setup;
/// the core never changes transport kind mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderType {
    /// Sequential read over an uncompressed file.
    Raw,
    /// Streaming zstd decompression backed by a whole-file mmap.
    Compressed,
    /// External shared-memory ring buffer, addressed by integer key.
    RingBuffer,
}

/// The capability set every transport variant implements.
///
/// Transports are opened per-port and read sequentially; none of them
/// support random seeks, only the narrow `peek_header` lookahead the
/// alignment and setup code needs.
pub trait Transport: Send {
    /// Read into `buf`, returning the number of bytes actually placed.
    ///
    /// A return value less than `buf.len()` means the source was exhausted
    /// (EOF on Raw/Compressed); it is not an error by itself -- the caller
    /// (C5) turns a short read into the tolerable `io_short_read` result.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Peek at the next `len` bytes without consuming them: the following
    /// `read_exact` call must see the same bytes again.
    fn peek_header(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Advise the transport that everything it has produced so far is no
    /// longer needed by the caller. Only meaningful for
    /// [`CompressedTransport`] (it drops the mmap pages already decoded);
    /// a no-op elsewhere. Called once per port after every successful read.
    fn advise_consumed(&mut self) {}

    /// Release all resources held by this transport. Called exactly once,
    /// from the session's `cleanup()`, but safe to call redundantly.
    fn close(&mut self) -> Result<()>;
}

/// Parameters needed to open a transport for one port. Constructed by the
/// session from [`crate::session::SessionConfig`] plus the port index.
#[derive(Debug, Clone)]
pub struct TransportOpenParams {
    /// Which port this transport serves (0-based).
    pub port_index: usize,
    /// Source path: a raw or zstd-compressed file, depending on kind.
    pub path: Option<std::path::PathBuf>,
    /// Base shared-memory key for ring-buffer transports.
    pub ring_buffer_base_key: Option<i32>,
    /// Per-port key stride for ring-buffer transports.
    pub ring_buffer_key_stride: i32,
    /// Packet length, if already known from a prior port's geometry.
    /// `None` before any port's header has been parsed.
    pub known_packet_len: Option<usize>,
}

/// Open a transport of the given kind for one port.
pub fn open(kind: ReaderType, params: TransportOpenParams) -> Result<Box<dyn Transport>> {
    match kind {
        ReaderType::Raw => Ok(Box::new(RawTransport::open(params)?)),
        ReaderType::Compressed => Ok(Box::new(CompressedTransport::open(params)?)),
        ReaderType::RingBuffer => Ok(Box::new(RingBufferTransport::open(params)?)),
    }
}
