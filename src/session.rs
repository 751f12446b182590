//! Session controller (C8): configuration, validation, defaults, and the
//! public setup/step/reuse/cleanup lifecycle.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationConfiguration;
use crate::constants::{DEFAULT_WORKER_THREADS, MAX_PORTS, MIN_WORKER_THREADS};
use crate::error::{Error, Result};
use crate::reader::{Reader, StepTimings, TolerableResult};
use crate::transport::ReaderType;

/// Every user-facing configuration knob, serializable for config-file or
/// CLI-driven construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of ports (1..=4); must equal `port_paths.len()` for file-backed
    /// transports.
    pub num_ports: usize,
    /// Per-port source path, for `Raw`/`Compressed` transports.
    #[serde(default)]
    pub port_paths: Vec<PathBuf>,
    /// Which transport variant every port uses.
    pub reader_type: ReaderType,
    /// Base shared-memory key, for `RingBuffer` transports.
    #[serde(default)]
    pub ring_buffer_base_key: Option<i32>,
    /// Per-port key stride, for `RingBuffer` transports.
    #[serde(default = "default_ring_buffer_key_stride")]
    pub ring_buffer_key_stride: i32,
    /// Window size, in packets, per `step`.
    pub packets_per_iteration: usize,
    /// 0/1: replay the guard-region packet on loss instead of zero-filling.
    #[serde(default)]
    pub replay_dropped_packets: bool,
    /// Raw processing-mode ID; resolved once at `setup` via
    /// [`crate::kernels::ProcessingMode::from_mode_id`].
    pub processing_mode: u32,
    /// Absolute target packet number; values before the LOFAR epoch mean
    /// "don't align".
    #[serde(default)]
    pub starting_packet: i64,
    /// Upper bound on cumulative packets consumed; negative means unbounded.
    #[serde(default = "default_packets_read_max")]
    pub packets_read_max: i64,
    /// Global `[lo, hi)` beamlet subrange; `(0, 0)` means "all".
    #[serde(default)]
    pub beamlet_limits: (u32, u32),
    /// Enable Jones-matrix calibration.
    #[serde(default)]
    pub calibrate_data: bool,
    /// Required when `calibrate_data` is set.
    #[serde(default)]
    pub calibration_configuration: Option<CalibrationConfiguration>,
    /// Worker thread count for the session's `rayon::ThreadPool`; silently
    /// raised to [`MIN_WORKER_THREADS`] if configured lower.
    #[serde(default = "default_omp_threads")]
    pub omp_threads: usize,
}

fn default_ring_buffer_key_stride() -> i32 {
    1
}

fn default_packets_read_max() -> i64 {
    -1
}

fn default_omp_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_ports: 1,
            port_paths: Vec::new(),
            reader_type: ReaderType::Raw,
            ring_buffer_base_key: None,
            ring_buffer_key_stride: default_ring_buffer_key_stride(),
            packets_per_iteration: 16,
            replay_dropped_packets: false,
            processing_mode: 0,
            starting_packet: -1,
            packets_read_max: default_packets_read_max(),
            beamlet_limits: (0, 0),
            calibrate_data: false,
            calibration_configuration: None,
            omp_threads: default_omp_threads(),
        }
    }
}

impl SessionConfig {
    /// Validate every cross-field invariant named in the external-interfaces
    /// and error-handling sections. Never panics on user input; returns
    /// `Error::ConfigInvalid` with a human-readable reason on the first
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        if self.num_ports == 0 || self.num_ports > MAX_PORTS {
            return Err(Error::config_invalid(format!(
                "num_ports must be in 1..={MAX_PORTS}, got {}",
                self.num_ports
            )));
        }
        if matches!(self.reader_type, ReaderType::Raw | ReaderType::Compressed)
            && self.port_paths.len() != self.num_ports
        {
            return Err(Error::config_invalid(format!(
                "port_paths has {} entries, expected {}",
                self.port_paths.len(),
                self.num_ports
            )));
        }
        if matches!(self.reader_type, ReaderType::RingBuffer) && self.ring_buffer_base_key.is_none() {
            return Err(Error::config_invalid(
                "ring_buffer_base_key is required for the ring_buffer transport",
            ));
        }
        if self.packets_per_iteration < 2 {
            return Err(Error::config_invalid(format!(
                "packets_per_iteration must be >= 2, got {}",
                self.packets_per_iteration
            )));
        }
        if self.beamlet_limits != (0, 0) {
            if self.beamlet_limits.0 >= self.beamlet_limits.1 {
                return Err(Error::config_invalid(format!(
                    "beamlet_limits {:?} is not a valid [lo, hi) range",
                    self.beamlet_limits
                )));
            }
            if self.processing_mode < 2 {
                return Err(Error::config_invalid(
                    "beamlet_limits requires a processing mode >= 2",
                ));
            }
        }
        if self.calibrate_data {
            if self.processing_mode < 2 {
                return Err(Error::config_invalid(
                    "calibrate_data is incompatible with copy modes 0/1",
                ));
            }
            let cal = self
                .calibration_configuration
                .as_ref()
                .ok_or_else(|| Error::config_invalid("calibrate_data requires calibration_configuration"))?;
            if cal.subband_spec.is_empty() {
                return Err(Error::config_invalid("calibration subband_spec must not be empty"));
            }
            if cal.pointing == [0.0, 0.0] {
                return Err(Error::config_invalid(
                    "calibration pointing must be set, got the unset default [0.0, 0.0]",
                ));
            }
        }
        Ok(())
    }

    /// Worker thread count after applying the `>= MIN_WORKER_THREADS` floor.
    pub fn worker_threads(&self) -> usize {
        self.omp_threads.max(MIN_WORKER_THREADS)
    }

    /// Load a configuration from a JSON document. Does not call [`Self::validate`];
    /// callers should validate (or let [`Reader::setup`](crate::reader::Reader::setup)
    /// validate) after loading.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config_invalid(format!("parsing config JSON: {e}")))
    }

    /// Serialize this configuration to a JSON document, e.g. to persist the
    /// configuration a run was launched with alongside its output.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::fatal(format!("serializing config JSON: {e}")))
    }
}

/// Owns a [`Reader`] across its lifecycle. Most callers should use this
/// rather than [`Reader`] directly.
pub struct Session {
    reader: Option<Reader>,
}

impl Session {
    /// Validate `config` and construct a reader with its first aligned
    /// window ready.
    pub fn setup(config: SessionConfig) -> Result<Self> {
        Ok(Self {
            reader: Some(Reader::setup(config)?),
        })
    }

    /// Produce the next window of output data.
    pub fn step(&mut self) -> Result<TolerableResult> {
        self.reader_mut()?.step()
    }

    /// Like [`Self::step`], additionally reporting `[read_duration,
    /// kernel_duration]`.
    pub fn step_timed(&mut self) -> Result<(TolerableResult, StepTimings)> {
        self.reader_mut()?.step_timed()
    }

    /// Re-align at a new target packet, resetting the cumulative counters.
    pub fn reuse(&mut self, new_target: i64, new_max: i64) -> Result<()> {
        self.reader_mut()?.reuse(new_target, new_max)
    }

    /// Release all resources. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.cleanup();
        }
    }

    /// Output buffers produced by the most recent `step`/`step_timed`.
    pub fn outputs(&self) -> Result<&[Vec<u8>]> {
        Ok(self.reader.as_ref().ok_or_else(closed_err)?.outputs())
    }

    fn reader_mut(&mut self) -> Result<&mut Reader> {
        self.reader.as_mut().ok_or_else(closed_err)
    }
}

fn closed_err() -> Error {
    Error::fatal("session is closed")
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_shape() {
        let mut config = SessionConfig::default();
        config.port_paths = vec![PathBuf::from("/dev/null")];
        assert_eq!(config.worker_threads(), DEFAULT_WORKER_THREADS);
    }

    #[test]
    fn rejects_too_many_ports() {
        let mut config = SessionConfig::default();
        config.num_ports = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_small_window() {
        let mut config = SessionConfig::default();
        config.port_paths = vec![PathBuf::from("/dev/null")];
        config.packets_per_iteration = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn raises_low_thread_count_to_floor() {
        let mut config = SessionConfig::default();
        config.omp_threads = 1;
        assert_eq!(config.worker_threads(), MIN_WORKER_THREADS);
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = SessionConfig::default();
        config.port_paths = vec![PathBuf::from("/data/port0.raw")];
        config.packets_per_iteration = 32;
        let json = config.to_json_string().unwrap();
        let parsed = SessionConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.packets_per_iteration, 32);
        assert_eq!(parsed.port_paths, config.port_paths);
    }

    #[test]
    fn beamlet_limits_require_mode_at_least_two() {
        let mut config = SessionConfig::default();
        config.port_paths = vec![PathBuf::from("/dev/null")];
        config.beamlet_limits = (0, 10);
        config.processing_mode = 1;
        assert!(config.validate().is_err());
    }
}
