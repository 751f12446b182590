//! Ring-buffer transport: an external shared-memory queue, addressed by
//! integer key.
//!
//! The real queue framework this core talks to is an external
//! collaborator (see the purpose/scope section of the design doc); what's
//! implemented here is the POSIX shared-memory attach/read contract the
//! core needs to satisfy the [`crate::transport::Transport`] trait, using
//! the same raw-`libc` mmap idiom the teacher's own double-mapped test
//! buffer uses, rather than a portable shared-memory crate (none of which
//! this ecosystem offers for a queue of this exact shape).

use std::ffi::CString;
use std::os::fd::RawFd;

use libc::{c_void, off_t, size_t};

use super::{Transport, TransportOpenParams};
use crate::constants::LEGACY_RING_BUFFER_PACKET_LEN;
use crate::error::{Error, Result};

/// Layout mirrored at the start of the shared-memory segment.
#[repr(C)]
struct RingHeader {
    /// Monotonically increasing total bytes the producer has written.
    write_pos: std::sync::atomic::AtomicU64,
    /// Monotonically increasing total bytes this consumer has read.
    read_pos: std::sync::atomic::AtomicU64,
    /// Size of the ring data area, in bytes, following this header.
    capacity: u64,
}

const HEADER_LEN: usize = std::mem::size_of::<RingHeader>();

/// Shared-memory ring buffer transport.
pub struct RingBufferTransport {
    shm_fd: RawFd,
    base: *mut u8,
    map_len: usize,
    shm_name: String,
    aligned: bool,
    known_packet_len: Option<usize>,
}

// Safety: the shared memory region is only ever touched through atomic
// operations on the header and plain byte copies out of the ring data area;
// no interior mutability is exposed to other threads without synchronization.
unsafe impl Send for RingBufferTransport {}

impl RingBufferTransport {
    pub(super) fn open(params: TransportOpenParams) -> Result<Self> {
        let base_key = params.ring_buffer_base_key.ok_or_else(|| Error::TransportOpenFailed {
            port: params.port_index,
            reason: "ring-buffer transport requires a base key".into(),
        })?;
        let key = base_key + params.port_index as i32 * params.ring_buffer_key_stride;
        let shm_name = format!("/lofar_rb_{key}");
        let cname = CString::new(shm_name.clone()).unwrap();

        // Safety: shm_open/mmap are standard POSIX calls; the fd is owned by
        // this struct and closed in `close`/`Drop`.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0o600) };
        if fd < 0 {
            return Err(Error::TransportOpenFailed {
                port: params.port_index,
                reason: format!("shm_open({shm_name}) failed: {}", std::io::Error::last_os_error()),
            });
        }

        let map_len = HEADER_LEN + 16 * 1024 * 1024; // data area size negotiated out of band
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len as size_t,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0 as off_t,
            )
        };
        if base == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(Error::TransportOpenFailed {
                port: params.port_index,
                reason: format!("mmap({shm_name}) failed: {}", std::io::Error::last_os_error()),
            });
        }

        Ok(Self {
            shm_fd: fd,
            base: base as *mut u8,
            map_len,
            shm_name,
            aligned: false,
            known_packet_len: params.known_packet_len,
        })
    }

    fn header(&self) -> &RingHeader {
        // Safety: `base` points at a mapping at least `HEADER_LEN` bytes long,
        // established in `open`.
        unsafe { &*(self.base as *const RingHeader) }
    }

    fn data_area(&self) -> &[u8] {
        // Safety: see `header`; the data area follows the header for
        // `capacity` bytes, which is within `map_len`.
        unsafe {
            std::slice::from_raw_parts(self.base.add(HEADER_LEN), self.map_len - HEADER_LEN)
        }
    }

    /// Align the read cursor to the nearest packet boundary, per §4.2/§6.
    /// Uses the parsed packet length once known, falling back to the
    /// historical hard-coded constant only before that (pre-first-header
    /// attach probing).
    fn ensure_aligned(&mut self) {
        if self.aligned {
            return;
        }
        let packet_len = self.known_packet_len.unwrap_or_else(|| {
            log::warn!(
                "ring buffer {} aligning with legacy packet length before geometry is known",
                self.shm_name
            );
            LEGACY_RING_BUFFER_PACKET_LEN
        });
        let pos = self.header().read_pos.load(std::sync::atomic::Ordering::Acquire) as usize;
        let rounded = pos.div_ceil(packet_len) * packet_len;
        let advance = rounded - pos;
        if advance > 0 {
            self.header()
                .read_pos
                .fetch_add(advance as u64, std::sync::atomic::Ordering::AcqRel);
        }
        self.aligned = true;
    }

    fn blocking_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_aligned();
        let capacity = self.header().capacity.max(1) as usize;
        let mut done = 0usize;
        while done < buf.len() {
            let write_pos = self.header().write_pos.load(std::sync::atomic::Ordering::Acquire);
            let read_pos = self.header().read_pos.load(std::sync::atomic::Ordering::Acquire);
            let available = write_pos.saturating_sub(read_pos) as usize;
            if available == 0 {
                std::thread::sleep(std::time::Duration::from_micros(200));
                continue;
            }
            let want = (buf.len() - done).min(available);
            let data = self.data_area();
            for i in 0..want {
                let ring_off = (read_pos as usize + i) % capacity;
                buf[done + i] = data[ring_off];
            }
            self.header()
                .read_pos
                .fetch_add(want as u64, std::sync::atomic::Ordering::AcqRel);
            done += want;
        }
        Ok(done)
    }
}

impl Transport for RingBufferTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.blocking_read(buf)
    }

    fn peek_header(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure_aligned();
        let capacity = self.header().capacity.max(1) as usize;
        let read_pos = self.header().read_pos.load(std::sync::atomic::Ordering::Acquire) as usize;
        // Block until at least `len` bytes are available, without consuming.
        loop {
            let write_pos = self.header().write_pos.load(std::sync::atomic::Ordering::Acquire) as usize;
            if write_pos.saturating_sub(read_pos) >= len {
                break;
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
        let data = self.data_area();
        Ok((0..len).map(|i| data[(read_pos + i) % capacity]).collect())
    }

    fn close(&mut self) -> Result<()> {
        // Safety: `base`/`shm_fd` were established in `open` and not yet
        // released.
        unsafe {
            if !self.base.is_null() {
                libc::munmap(self.base as *mut c_void, self.map_len as size_t);
                self.base = std::ptr::null_mut();
            }
            if self.shm_fd >= 0 {
                libc::close(self.shm_fd);
                self.shm_fd = -1;
            }
        }
        Ok(())
    }
}

impl Drop for RingBufferTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
