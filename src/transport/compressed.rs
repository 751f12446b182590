//! Compressed transport: streaming zstd decompression backed by a
//! read-only whole-file mmap.
//!
//! Resolves the open question in the design doc: the compressed file is
//! always `File::open`ed explicitly before mapping, rather than mapping an
//! uninitialised descriptor.

use std::collections::VecDeque;
use std::fs::File;

use memmap2::Mmap;
use zstd::stream::raw::{Decoder as RawDecoder, InBuffer, Operation, OutBuffer};

use super::{Transport, TransportOpenParams};
use crate::error::{Error, Result};

/// Streaming-decompression transport over a memory-mapped zstd file.
pub struct CompressedTransport {
    mmap: Mmap,
    decoder: RawDecoder<'static>,
    /// Bytes of the compressed source consumed so far.
    reading_pos: usize,
    /// Bytes of decompressed output produced so far.
    decompression_pos: usize,
    /// Decoded bytes produced but not yet handed to a caller (used to
    /// support `peek_header` without disturbing the real read path, and to
    /// hold overshoot that didn't fit in the caller's destination buffer).
    pending: VecDeque<u8>,
    finished: bool,
}

impl CompressedTransport {
    pub(super) fn open(params: TransportOpenParams) -> Result<Self> {
        let path = params.path.ok_or_else(|| Error::TransportOpenFailed {
            port: params.port_index,
            reason: "compressed transport requires a file path".into(),
        })?;
        let file = File::open(&path).map_err(|e| Error::TransportOpenFailed {
            port: params.port_index,
            reason: format!("opening {}: {e}", path.display()),
        })?;
        // Safety: the file is opened read-only above and is not expected to be
        // truncated or modified by another process while mapped; the mapping
        // outlives only this transport's lifetime.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::TransportOpenFailed {
            port: params.port_index,
            reason: format!("mmap of {}: {e}", path.display()),
        })?;
        mmap.advise(memmap2::Advice::Sequential).ok();

        let decoder = RawDecoder::new().map_err(|e| Error::TransportOpenFailed {
            port: params.port_index,
            reason: format!("zstd decoder init: {e}"),
        })?;

        Ok(Self {
            mmap,
            decoder,
            reading_pos: 0,
            decompression_pos: 0,
            pending: VecDeque::new(),
            finished: false,
        })
    }

    /// Decompress forward until at least `want` more bytes sit in `pending`,
    /// or the compressed source is exhausted.
    fn fill_pending(&mut self, want: usize) -> Result<()> {
        let mut scratch = vec![0u8; 64 * 1024];
        while self.pending.len() < want && !self.finished {
            if self.reading_pos >= self.mmap.len() {
                self.finished = true;
                break;
            }
            let mut in_buf = InBuffer::around(&self.mmap[self.reading_pos..]);
            let mut out_buf = OutBuffer::around(&mut scratch[..]);
            let hint = self
                .decoder
                .run(&mut in_buf, &mut out_buf)
                .map_err(|e| Error::Fatal(format!("zstd decode error: {e}")))?;
            let consumed = in_buf.pos();
            let produced = out_buf.pos();
            self.reading_pos += consumed;
            self.decompression_pos += produced;
            self.pending.extend(&scratch[..produced]);
            if hint == 0 && consumed == 0 && produced == 0 {
                // Frame complete and no more input available this round.
                self.finished = true;
            }
        }
        Ok(())
    }
}

impl Transport for CompressedTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.fill_pending(buf.len())?;
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap();
        }
        Ok(n)
    }

    fn peek_header(&mut self, len: usize) -> Result<Vec<u8>> {
        self.fill_pending(len)?;
        let n = len.min(self.pending.len());
        Ok(self.pending.iter().take(n).copied().collect())
    }

    fn advise_consumed(&mut self) {
        let page = 4096usize;
        let aligned = self.reading_pos.saturating_sub(self.reading_pos % page);
        if aligned == 0 {
            return;
        }
        if let Err(e) = self.mmap.advise_range(memmap2::Advice::DontNeed, 0, aligned.min(self.mmap.len())) {
            log::warn!("madvise(DONTNEED) failed on compressed transport: {e}");
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zstd_encode(data: &[u8]) -> Vec<u8> {
        zstd::stream::encode_all(data, 3).expect("zstd encode")
    }

    #[test]
    fn round_trips_small_stream() -> anyhow::Result<()> {
        let payload: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        let compressed = zstd_encode(&payload);

        let tmpd = tempfile::tempdir()?;
        let path = tmpd.path().join("port.zst");
        std::fs::write(&path, &compressed)?;

        let mut t = CompressedTransport::open(TransportOpenParams {
            port_index: 0,
            path: Some(path),
            ring_buffer_base_key: None,
            ring_buffer_key_stride: 0,
            known_packet_len: None,
        })?;

        let mut out = vec![0u8; payload.len()];
        let n = t.read_exact(&mut out)?;
        assert_eq!(n, payload.len());
        assert_eq!(out, payload);
        Ok(())
    }

    #[test]
    fn peek_header_matches_subsequent_read() -> anyhow::Result<()> {
        let payload: Vec<u8> = (0u8..16).collect();
        let compressed = zstd_encode(&payload);
        let tmpd = tempfile::tempdir()?;
        let path = tmpd.path().join("port.zst");
        std::fs::write(&path, &compressed)?;

        let mut t = CompressedTransport::open(TransportOpenParams {
            port_index: 0,
            path: Some(path),
            ring_buffer_base_key: None,
            ring_buffer_key_stride: 0,
            known_packet_len: None,
        })?;

        let peeked = t.peek_header(8)?;
        let mut read_back = vec![0u8; 8];
        t.read_exact(&mut read_back)?;
        assert_eq!(peeked, read_back);
        Ok(())
    }
}
