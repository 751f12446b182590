//! The core's closed error taxonomy.
//!
//! Every fatal condition the reader can hit is a variant of [`Error`].
//! Propagation is always by explicit `Result` return, never by unwinding;
//! the two *tolerable* step outcomes (`io_short_read`, `packet_cap_reached`)
//! are deliberately not `Error` variants — see [`crate::reader::TolerableResult`].

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why [`crate::packet::parse_headers`] rejected a set of port headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseFailKind {
    /// RSP version below the minimum this core understands.
    #[error("RSP version below minimum")]
    BadVersion,
    /// Timestamp predates [`crate::constants::LOFAR_EPOCH`].
    #[error("timestamp predates the LOFAR epoch")]
    PreEpoch,
    /// Intra-second sequence counter exceeds the 200 MHz clock maximum.
    #[error("sequence counter overflowed")]
    SeqOverflow,
    /// Packet claims more beamlets than hardware allows.
    #[error("too many beamlets in packet")]
    TooManyBeamlets,
    /// Packet's timeslice count isn't the fixed hardware constant.
    #[error("wrong timeslice count")]
    WrongTimeslice,
    /// A reserved bit in the source byte was set.
    #[error("reserved bit set in source byte")]
    ReservedBitSet,
    /// The packet's error bit was set.
    #[error("error bit set in source byte")]
    ErrorBitSet,
    /// Bit-mode selector 3, which is illegal.
    #[error("illegal bit mode (3)")]
    IllegalBitmode,
    /// Ports disagree on clock bit.
    #[error("ports report different clock bits")]
    MixedClocks,
    /// Ports disagree on bit-mode.
    #[error("ports report different bit modes")]
    MixedBitmodes,
}

/// Every error the core itself can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration failed [`crate::session::SessionConfig::validate`].
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A transport could not be opened for a port.
    #[error("transport open failed for port {port}: {reason}")]
    TransportOpenFailed {
        /// Index of the port whose transport failed to open.
        port: usize,
        /// Human-readable reason, usually wrapping an `io::Error`.
        reason: String,
    },

    /// Header parsing/validation failed (see [`ParseFailKind`]).
    #[error("packet header parse failed on port {port}: {kind}")]
    ParseFailed {
        /// Index of the offending port, if attributable to one port.
        port: usize,
        /// Which invariant was violated.
        kind: ParseFailKind,
    },

    /// [`crate::align::skip_to_packet`] could not reach the requested target.
    #[error("alignment failed: {0}")]
    AlignFailed(String),

    /// The requested target packet is before one port's current position.
    #[error("target packet {target} is in the past for port {port} (at {current})")]
    TargetInPast {
        /// Port that has already passed the requested target.
        port: usize,
        /// Target packet number that was requested.
        target: i64,
        /// The port's actual current packet number.
        current: i64,
    },

    /// The external Jones-matrix generator failed, or its output was malformed.
    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    /// An error that does not fit a more specific category; the session
    /// is invalidated and `cleanup()` must be called.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Wraps an I/O error from a transport, promoted to fatal by the caller
    /// when it isn't a tolerable short read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::ConfigInvalid`] from a formattable reason.
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Error::ConfigInvalid(reason.into())
    }

    /// Build a [`Error::Fatal`] from a formattable reason.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Error::Fatal(reason.into())
    }
}
