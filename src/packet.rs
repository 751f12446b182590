//! Packet model (C1): parsing and validating the 16-byte RSP wire header.
//!
//! The header layout (all fields little-endian) is:
//!
//! ```text
//! offset  size  field
//! 0       1     version
//! 1       1     source (clock bit, bit-mode, error bit, 2 flag bits, station id)
//! 2       2     (reserved / unused by the core)
//! 4       4     timestamp (seconds since 1970)
//! 8       4     sequence (intra-second counter)
//! 12      2     beamlets in this packet
//! 14      2     timeslices in this packet
//! ```
//!
//! The core never constructs packets; it only ever parses bytes handed to it
//! by a [`crate::transport::Transport`].

use crate::constants::{
    CLOCK_RATE_160MHZ, CLOCK_RATE_200MHZ, COMPLEX_COMPONENTS, HEADER_LEN, LOFAR_EPOCH,
    MAX_BEAMLETS_PER_PACKET, POLARISATIONS, TIMESLICES_PER_PACKET,
};
use crate::error::{Error, ParseFailKind, Result};

/// Minimum RSP firmware version this core understands.
const MIN_RSP_VERSION: u8 = 2;

/// Maximum intra-second sequence value, at the 200 MHz clock rate.
const MAX_SEQUENCE_200MHZ: u32 = 195_312; // 200e6 / 1024, rounded down to a safe ceiling

/// A borrowed view over one packet's 16-byte header.
#[derive(Debug, Clone, Copy)]
pub struct HeaderView<'a>(&'a [u8]);

impl<'a> HeaderView<'a> {
    /// Wrap a byte slice as a header view.
    ///
    /// # Panics
    /// Panics if `data` is shorter than [`HEADER_LEN`] -- callers are
    /// expected to have already sized their buffers correctly; this is an
    /// internal invariant violation, not a malformed-input condition.
    pub fn new(data: &'a [u8]) -> Self {
        assert!(
            data.len() >= HEADER_LEN,
            "header view requires at least {HEADER_LEN} bytes, got {}",
            data.len()
        );
        Self(&data[..HEADER_LEN])
    }

    /// RSP firmware version.
    pub fn version(&self) -> u8 {
        self.0[0]
    }

    fn source_byte(&self) -> u8 {
        self.0[1]
    }

    /// Clock bit: `false` = 160 MHz, `true` = 200 MHz.
    pub fn clock_bit(&self) -> bool {
        self.source_byte() & 0b1000_0000 != 0
    }

    /// Bit-mode selector: 0 -> 16-bit, 1 -> 8-bit, 2 -> 4-bit, 3 -> illegal.
    pub fn bit_mode(&self) -> u8 {
        (self.source_byte() >> 5) & 0b11
    }

    /// Error bit; must be clear.
    pub fn error_bit(&self) -> bool {
        self.source_byte() & 0b0001_0000 != 0
    }

    /// The two padding/flag bits, returned raw for diagnostics.
    pub fn flag_bits(&self) -> u8 {
        (self.source_byte() >> 2) & 0b11
    }

    /// Station ID, packed into the low 2 bits of the source byte.
    pub fn station_id(&self) -> u8 {
        self.source_byte() & 0b11
    }

    /// Absolute timestamp, seconds since 1970.
    pub fn timestamp(&self) -> u32 {
        u32::from_le_bytes(self.0[4..8].try_into().unwrap())
    }

    /// Intra-second sequence counter.
    pub fn sequence(&self) -> u32 {
        u32::from_le_bytes(self.0[8..12].try_into().unwrap())
    }

    /// Beamlets carried by this packet.
    pub fn beamlet_count(&self) -> u16 {
        u16::from_le_bytes(self.0[12..14].try_into().unwrap())
    }

    /// Timeslices carried by this packet.
    pub fn timeslice_count(&self) -> u16 {
        u16::from_le_bytes(self.0[14..16].try_into().unwrap())
    }

    /// Clock rate in Hz implied by [`Self::clock_bit`].
    pub fn clock_rate(&self) -> u64 {
        if self.clock_bit() {
            CLOCK_RATE_200MHZ
        } else {
            CLOCK_RATE_160MHZ
        }
    }

    /// The monotonic logical packet number: `(seconds * clockRate + sequence) / timeslicesPerPacket`.
    pub fn packet_number(&self) -> i64 {
        let seconds = self.timestamp() as u64;
        let total = seconds * self.clock_rate() + self.sequence() as u64;
        (total / TIMESLICES_PER_PACKET as u64) as i64
    }
}

/// Bytes-per-sample as a ratio, exact even for 4-bit mode (1/2).
pub fn bytes_per_sample_num_den(bit_mode: u8) -> (u32, u32) {
    match bit_mode {
        0 => (2, 1),
        1 => (1, 1),
        2 => (1, 2),
        other => panic!("illegal bit mode {other} reached bytes_per_sample_num_den"),
    }
}

/// Per-port geometry derived from a validated set of headers.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// Bit-mode shared by all ports.
    pub bit_mode: u8,
    /// Clock bit shared by all ports.
    pub clock_bit: bool,
    /// Station id, taken from port 0's header.
    pub station_id: u8,
    /// Raw beamlets carried by each port's packets.
    pub port_raw_beamlets: Vec<u32>,
    /// Cumulative raw beamlets before each port (prefix sum).
    pub port_raw_cumulative_beamlets: Vec<u32>,
    /// Per-port packet length in bytes (header + payload).
    pub port_packet_length: Vec<usize>,
    /// Global beamlet subrange lower bound (inclusive), translated to the
    /// concatenated raw-beamlet space.
    pub base_beamlets: u32,
    /// Global beamlet subrange upper bound (exclusive).
    pub upper_beamlets: u32,
    /// Cumulative *processed* beamlets before each port (prefix sum), i.e.
    /// after applying the [`Self::base_beamlets`]/[`Self::upper_beamlets`] clip.
    pub port_cumulative_beamlets: Vec<u32>,
    /// Whether per-port packet lengths differed (a warning, not a failure).
    pub mixed_packet_lengths: bool,
}

impl Geometry {
    /// Total raw beamlets across all ports.
    pub fn total_raw_beamlets(&self) -> u32 {
        self.port_raw_beamlets.iter().sum()
    }

    /// Total beamlets selected for processing, after the beamlet-limits clip.
    pub fn total_proc_beamlets(&self) -> u32 {
        self.upper_beamlets.saturating_sub(self.base_beamlets)
    }
}

/// Validate headers from every port and derive the shared [`Geometry`].
///
/// `beamlet_limits` is the configured `[lo, hi)` global subrange; `(0, 0)`
/// means "all beamlets".
pub fn parse_headers(headers: &[&[u8]], beamlet_limits: (u32, u32)) -> Result<Geometry> {
    assert!(!headers.is_empty(), "parse_headers called with no ports");

    let mut port_raw_beamlets = Vec::with_capacity(headers.len());
    let mut port_packet_length = Vec::with_capacity(headers.len());
    let mut bit_mode = None;
    let mut clock_bit = None;
    let mut station_id = None;
    let mut mixed_packet_lengths = false;

    for (port, raw) in headers.iter().enumerate() {
        let h = HeaderView::new(raw);

        if h.version() < MIN_RSP_VERSION {
            return Err(Error::ParseFailed {
                port,
                kind: ParseFailKind::BadVersion,
            });
        }
        if h.timestamp() < LOFAR_EPOCH {
            return Err(Error::ParseFailed {
                port,
                kind: ParseFailKind::PreEpoch,
            });
        }
        if h.sequence() > MAX_SEQUENCE_200MHZ {
            return Err(Error::ParseFailed {
                port,
                kind: ParseFailKind::SeqOverflow,
            });
        }
        if h.beamlet_count() as u32 > MAX_BEAMLETS_PER_PACKET {
            return Err(Error::ParseFailed {
                port,
                kind: ParseFailKind::TooManyBeamlets,
            });
        }
        if h.timeslice_count() as u32 != TIMESLICES_PER_PACKET {
            return Err(Error::ParseFailed {
                port,
                kind: ParseFailKind::WrongTimeslice,
            });
        }
        if h.flag_bits() != 0 {
            return Err(Error::ParseFailed {
                port,
                kind: ParseFailKind::ReservedBitSet,
            });
        }
        if h.error_bit() {
            return Err(Error::ParseFailed {
                port,
                kind: ParseFailKind::ErrorBitSet,
            });
        }
        if h.bit_mode() == 3 {
            return Err(Error::ParseFailed {
                port,
                kind: ParseFailKind::IllegalBitmode,
            });
        }

        match clock_bit {
            None => clock_bit = Some(h.clock_bit()),
            Some(c) if c != h.clock_bit() => {
                return Err(Error::ParseFailed {
                    port,
                    kind: ParseFailKind::MixedClocks,
                });
            }
            _ => {}
        }
        match bit_mode {
            None => bit_mode = Some(h.bit_mode()),
            Some(b) if b != h.bit_mode() => {
                return Err(Error::ParseFailed {
                    port,
                    kind: ParseFailKind::MixedBitmodes,
                });
            }
            _ => {}
        }
        if port == 0 {
            station_id = Some(h.station_id());
        }

        let (num, den) = bytes_per_sample_num_den(h.bit_mode());
        let payload_bits = h.beamlet_count() as u64
            * TIMESLICES_PER_PACKET as u64
            * POLARISATIONS as u64
            * COMPLEX_COMPONENTS as u64
            * num as u64;
        let payload_bytes = (payload_bits as usize).div_ceil(den as usize);
        let packet_len = HEADER_LEN + payload_bytes;

        if let Some(&first) = port_packet_length.first() {
            if first != packet_len {
                mixed_packet_lengths = true;
            }
        }
        port_packet_length.push(packet_len);
        port_raw_beamlets.push(h.beamlet_count() as u32);
    }

    let mut port_raw_cumulative_beamlets = Vec::with_capacity(port_raw_beamlets.len() + 1);
    let mut running = 0u32;
    for &b in &port_raw_beamlets {
        port_raw_cumulative_beamlets.push(running);
        running += b;
    }
    let total_raw = running;

    let (base_beamlets, upper_beamlets) = if beamlet_limits == (0, 0) {
        (0, total_raw)
    } else {
        beamlet_limits
    };

    let mut port_cumulative_beamlets = Vec::with_capacity(port_raw_beamlets.len());
    let mut proc_running = 0u32;
    for (i, &raw_count) in port_raw_beamlets.iter().enumerate() {
        let port_lo = port_raw_cumulative_beamlets[i];
        let port_hi = port_lo + raw_count;
        let clipped_lo = base_beamlets.max(port_lo).min(port_hi);
        let clipped_hi = upper_beamlets.min(port_hi).max(port_lo);
        let count = clipped_hi.saturating_sub(clipped_lo);
        port_cumulative_beamlets.push(proc_running);
        proc_running += count;
    }

    Ok(Geometry {
        bit_mode: bit_mode.unwrap(),
        clock_bit: clock_bit.unwrap(),
        station_id: station_id.unwrap(),
        port_raw_beamlets,
        port_raw_cumulative_beamlets,
        port_packet_length,
        base_beamlets,
        upper_beamlets,
        port_cumulative_beamlets,
        mixed_packet_lengths,
    })
}
