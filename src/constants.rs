//! System-wide constants for the RSP wire format.
//!
//! These mirror the fixed hardware parameters of the current LOFAR RSP
//! boards. None of them are configurable at runtime: a different hardware
//! generation would need a new build, not a new config value.

/// Seconds since the Unix epoch at which the LOFAR RSP clock epoch begins.
/// Any packet header timestamp before this is nonsensical and rejected.
pub const LOFAR_EPOCH: u32 = 1_072_915_200; // 2004-01-01T00:00:00Z

/// Clock rate, in Hz, when the packet's clock bit selects 160 MHz.
pub const CLOCK_RATE_160MHZ: u64 = 160_000_000;

/// Clock rate, in Hz, when the packet's clock bit selects 200 MHz.
pub const CLOCK_RATE_200MHZ: u64 = 200_000_000;

/// Number of timeslices a single packet must carry, on current hardware.
pub const TIMESLICES_PER_PACKET: u32 = 16;

/// Number of polarisations per beamlet (X and Y).
pub const POLARISATIONS: u32 = 2;

/// Scalar components per complex sample (real, imaginary). Every
/// polarisation's sample is a complex pair, so a packet's payload carries
/// `POLARISATIONS * COMPLEX_COMPONENTS` scalar values per beamlet per
/// timeslice.
pub const COMPLEX_COMPONENTS: u32 = 2;

/// Hardware ceiling on beamlets carried by a single packet.
pub const MAX_BEAMLETS_PER_PACKET: u32 = 244;

/// Size in bytes of the fixed packet header.
pub const HEADER_LEN: usize = 16;

/// Maximum number of ports (RSP boards) a session can open.
pub const MAX_PORTS: usize = 4;

/// Minimum worker threads in the session's rayon pool, regardless of
/// what `ompThreads` asks for.
pub const MIN_WORKER_THREADS: usize = 4;

/// Default worker thread count when configuration doesn't need to raise it.
pub const DEFAULT_WORKER_THREADS: usize = 8;

/// Historical hard-coded ring-buffer packet length, used only before a
/// port's geometry has been parsed from its first header.
pub const LEGACY_RING_BUFFER_PACKET_LEN: usize = 7824;

/// Convert a packet bit-mode selector (0, 1, 2) to bytes per sample.
///
/// Bit-mode 2 (4-bit) packs two samples per byte; the return value is
/// therefore only exact for modes 0 and 1. Callers needing payload sizes
/// for 4-bit packets must special-case it (see [`crate::packet::bytes_per_sample_num_den`]).
pub fn bytes_per_sample_rounded(bit_mode: u8) -> usize {
    match bit_mode {
        0 => 2,
        1 => 1,
        2 => 1, // two 4-bit samples share this byte; caller halves the count
        other => panic!("illegal bit mode {other} reached bytes_per_sample_rounded"),
    }
}
