//! Raw transport: sequential reads over an uncompressed file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use super::{Transport, TransportOpenParams};
use crate::error::{Error, Result};

/// Sequential byte-stream transport over a plain file.
pub struct RawTransport {
    file: File,
}

impl RawTransport {
    pub(super) fn open(params: TransportOpenParams) -> Result<Self> {
        let path = params.path.ok_or_else(|| Error::TransportOpenFailed {
            port: params.port_index,
            reason: "raw transport requires a file path".into(),
        })?;
        let file = File::open(&path).map_err(|e| Error::TransportOpenFailed {
            port: params.port_index,
            reason: format!("opening {}: {e}", path.display()),
        })?;
        Ok(Self { file })
    }
}

impl Transport for RawTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn peek_header(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut header = vec![0u8; len];
        let n = self.read_exact(&mut header)?;
        header.truncate(n);
        self.file.seek(SeekFrom::Current(-(n as i64)))?;
        Ok(header)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_does_not_consume() -> anyhow::Result<()> {
        let tmpd = tempfile::tempdir()?;
        let path = tmpd.path().join("port.bin");
        std::fs::write(&path, [1u8, 2, 3, 4, 5, 6, 7, 8])?;

        let mut t = RawTransport::open(TransportOpenParams {
            port_index: 0,
            path: Some(path),
            ring_buffer_base_key: None,
            ring_buffer_key_stride: 0,
            known_packet_len: None,
        })?;

        let peeked = t.peek_header(4)?;
        assert_eq!(peeked, vec![1, 2, 3, 4]);

        let mut buf = [0u8; 4];
        let n = t.read_exact(&mut buf)?;
        assert_eq!(n, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn short_read_on_exhaustion() -> anyhow::Result<()> {
        let tmpd = tempfile::tempdir()?;
        let path = tmpd.path().join("port.bin");
        std::fs::write(&path, [1u8, 2, 3])?;

        let mut t = RawTransport::open(TransportOpenParams {
            port_index: 0,
            path: Some(path),
            ring_buffer_base_key: None,
            ring_buffer_key_stride: 0,
            known_packet_len: None,
        })?;
        let mut buf = [0u8; 8];
        let n = t.read_exact(&mut buf)?;
        assert_eq!(n, 3);
        Ok(())
    }
}
