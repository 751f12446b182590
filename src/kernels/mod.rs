//! Processing kernels (C6): the closed set of ~40 fixed reformatting
//! transforms, selected once at setup and dispatched per step.
//!
//! Per the redesign note in the design doc, the mode space is a tagged
//! enum built once by [`ProcessingMode::from_mode_id`] rather than a
//! switch over a raw integer, so reserved mode IDs are unrepresentable.

mod stokes;

use rayon::prelude::*;

use crate::calibration::CalibrationSource;
use crate::constants::{HEADER_LEN, POLARISATIONS, TIMESLICES_PER_PACKET};
use crate::error::{Error, Result};
use crate::packet::{bytes_per_sample_num_den, Geometry};
use crate::reader::PortState;
use crate::session::SessionConfig;

pub use stokes::StokesComponent;

/// A fully resolved processing mode. Constructed once, at session setup,
/// from a raw mode ID; never changes for the life of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Modes 0/1: verbatim per-port copy, with or without the wire header.
    Copy { with_header: bool },
    /// Modes 10/20/30: reorder into a single frequency-time plane.
    Reorder,
    /// Modes 2/11/21/31 (4 planes) and 32 (2 planes): split interleaved
    /// polarisation components into separate output planes.
    Split { planes: usize },
    /// Modes 100-134: a single Stokes component, optionally decimated.
    Stokes {
        which: StokesComponent,
        decimation: u32,
    },
    /// Modes 150-154: all four Stokes components, optionally decimated.
    StokesAll { decimation: u32 },
    /// Modes 160-164: the I/V pair, optionally decimated.
    TwoStokes { decimation: u32 },
}

impl ProcessingMode {
    /// Resolve a raw `processingMode` configuration value. Rejects anything
    /// outside the enumerated set, including the reserved bit-mode-3-style
    /// gaps in the ID space.
    pub fn from_mode_id(id: u32, calibrate: bool) -> Result<Self> {
        use StokesComponent::*;
        let mode = match id {
            0 => ProcessingMode::Copy { with_header: true },
            1 => ProcessingMode::Copy { with_header: false },
            2 | 11 | 21 | 31 => ProcessingMode::Split { planes: 4 },
            10 | 20 | 30 => ProcessingMode::Reorder,
            32 => ProcessingMode::Split { planes: 2 },
            100 => ProcessingMode::Stokes { which: I, decimation: 1 },
            110 => ProcessingMode::Stokes { which: Q, decimation: 1 },
            120 => ProcessingMode::Stokes { which: U, decimation: 1 },
            130 => ProcessingMode::Stokes { which: V, decimation: 1 },
            101..=104 | 111..=114 | 121..=124 | 131..=134 => {
                let which = match id / 10 {
                    10 => I,
                    11 => Q,
                    12 => U,
                    13 => V,
                    _ => unreachable!(),
                };
                ProcessingMode::Stokes {
                    which,
                    decimation: 1 << ((id % 10) + 2),
                }
            }
            150 => ProcessingMode::StokesAll { decimation: 1 },
            151..=154 => ProcessingMode::StokesAll {
                decimation: 1 << (id % 10),
            },
            160 => ProcessingMode::TwoStokes { decimation: 1 },
            161..=164 => ProcessingMode::TwoStokes {
                decimation: 1 << ((id % 10) + 1),
            },
            other => {
                return Err(Error::config_invalid(format!(
                    "processing mode {other} is not a recognised mode id"
                )))
            }
        };

        if calibrate && matches!(mode, ProcessingMode::Copy { .. }) {
            return Err(Error::config_invalid(
                "calibrateData is incompatible with copy modes 0/1",
            ));
        }
        Ok(mode)
    }

    /// Number of output planes and each plane's per-packet byte length, for
    /// the given geometry and configuration.
    pub fn output_shape(&self, geometry: &Geometry, config: &SessionConfig) -> (usize, Vec<usize>) {
        let proc_beamlets = geometry.total_proc_beamlets() as usize;
        let ts = TIMESLICES_PER_PACKET as usize;
        let pols = POLARISATIONS as usize;
        let (in_num, in_den) = bytes_per_sample_num_den(geometry.bit_mode);
        let in_sample_bytes = |count: usize| (count * in_num as usize).div_ceil(in_den as usize);

        match self {
            ProcessingMode::Copy { with_header } => {
                let lens = geometry
                    .port_packet_length
                    .iter()
                    .map(|&l| if *with_header { l } else { l - HEADER_LEN })
                    .collect();
                (geometry.port_packet_length.len(), lens)
            }
            ProcessingMode::Reorder => {
                let len = in_sample_bytes(proc_beamlets * ts * pols * 2);
                (1, vec![len])
            }
            ProcessingMode::Split { planes } => {
                // Each plane carries one component (Xre/Xim/Yre/Yim, or X/Y
                // as full complex pairs when planes == 2) per beamlet per
                // timeslice, unpacked to at least 8 bits per the mode table.
                let out_sample_bytes = out_sample_bytes_unpacked(geometry.bit_mode);
                let components_per_plane = if *planes == 4 { 1 } else { 2 };
                let len = proc_beamlets * ts * components_per_plane * out_sample_bytes;
                (*planes, vec![len; *planes])
            }
            ProcessingMode::Stokes { decimation, .. } => {
                let out_ts = (ts / *decimation as usize).max(1);
                let len = proc_beamlets * out_ts * 4; // f32 output
                (1, vec![len])
            }
            ProcessingMode::StokesAll { decimation } => {
                let out_ts = (ts / *decimation as usize).max(1);
                let len = proc_beamlets * out_ts * 4;
                (4, vec![len; 4])
            }
            ProcessingMode::TwoStokes { decimation } => {
                let out_ts = (ts / *decimation as usize).max(1);
                let len = proc_beamlets * out_ts * 4;
                let _ = config;
                (2, vec![len; 2])
            }
        }
    }
}

fn out_sample_bytes_unpacked(bit_mode: u8) -> usize {
    match bit_mode {
        2 => 1, // 4-bit unpacked to 8-bit
        _ => crate::constants::bytes_per_sample_rounded(bit_mode),
    }
}

/// Unpack one byte of two 4-bit samples into two sign-extended 8-bit values.
fn unpack_4bit(byte: u8) -> (i8, i8) {
    let lo = (byte & 0x0f) as i8;
    let hi = ((byte >> 4) & 0x0f) as i8;
    let sign_extend = |v: i8| if v & 0x08 != 0 { v | !0x0f } else { v };
    (sign_extend(lo), sign_extend(hi))
}

/// Run the selected kernel over the current window, filling `outputs`.
///
/// `ports` carries each port's buffer, already fully resolved slot-by-slot
/// (real, replayed, or zeroed) by the reader before this is called; kernels
/// only need to read it. The fan-out itself runs on `pool`, one rayon task
/// per output plane.
pub fn dispatch(
    mode: &ProcessingMode,
    ports: &[PortState],
    geometry: &Geometry,
    config: &SessionConfig,
    packets_per_iteration: usize,
    calibration: Option<&CalibrationSource>,
    calibration_step: u64,
    pool: &rayon::ThreadPool,
    outputs: &mut [Vec<u8>],
) -> Result<()> {
    if packets_per_iteration == 0 {
        return Ok(());
    }

    pool.install(|| -> Result<()> {
        match mode {
            ProcessingMode::Copy { with_header } => {
                outputs
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(port_idx, out)| {
                        copy_kernel(&ports[port_idx], packets_per_iteration, *with_header, out);
                    });
                Ok(())
            }
            ProcessingMode::Reorder => {
                reorder_kernel(ports, geometry, config, packets_per_iteration, &mut outputs[0]);
                Ok(())
            }
            ProcessingMode::Split { planes } => {
                split_kernel(ports, geometry, config, packets_per_iteration, *planes, outputs);
                Ok(())
            }
            ProcessingMode::Stokes { which, decimation } => {
                stokes::single_component(
                    *which,
                    *decimation,
                    ports,
                    geometry,
                    config,
                    packets_per_iteration,
                    calibration,
                    calibration_step,
                    &mut outputs[0],
                )
            }
            ProcessingMode::StokesAll { decimation } => stokes::all_components(
                *decimation,
                ports,
                geometry,
                config,
                packets_per_iteration,
                calibration,
                calibration_step,
                outputs,
            ),
            ProcessingMode::TwoStokes { decimation } => stokes::two_components(
                *decimation,
                ports,
                geometry,
                config,
                packets_per_iteration,
                calibration,
                calibration_step,
                outputs,
            ),
        }
    })
}

fn copy_kernel(port: &PortState, ppi: usize, with_header: bool, out: &mut Vec<u8>) {
    let packet_len = port.buffer.packet_len();
    let out_len = if with_header { packet_len } else { packet_len - HEADER_LEN };
    out.clear();
    out.resize(out_len * ppi, 0);
    for slot in 0..ppi {
        let packet = port.buffer.packet_at(slot as isize);
        let src = if with_header { packet } else { &packet[HEADER_LEN..] };
        out[slot * out_len..(slot + 1) * out_len].copy_from_slice(src);
    }
}

fn reorder_kernel(
    ports: &[PortState],
    geometry: &Geometry,
    config: &SessionConfig,
    ppi: usize,
    out: &mut Vec<u8>,
) {
    let out_len = ProcessingMode::Reorder.output_shape(geometry, config).1[0];
    out.clear();
    out.resize(out_len * ppi, 0);
    for slot in 0..ppi {
        let mut cursor = slot * out_len;
        for port in ports {
            let packet = port.buffer.packet_at(slot as isize);
            let payload = &packet[HEADER_LEN..];
            let n = payload.len().min(out_len - (cursor - slot * out_len));
            out[cursor..cursor + n].copy_from_slice(&payload[..n]);
            cursor += n;
        }
    }
}

fn split_kernel(
    ports: &[PortState],
    geometry: &Geometry,
    config: &SessionConfig,
    ppi: usize,
    planes: usize,
    outputs: &mut [Vec<u8>],
) {
    let out_len = ProcessingMode::Split { planes }.output_shape(geometry, config).1[0];
    for out in outputs.iter_mut() {
        out.clear();
        out.resize(out_len * ppi, 0);
    }

    let bit_mode = geometry.bit_mode;
    outputs.par_iter_mut().enumerate().for_each(|(plane, out)| {
        for slot in 0..ppi {
            let dst_base = slot * out_len;
            let mut dst_idx = 0;
            for port in ports {
                let packet = port.buffer.packet_at(slot as isize);
                let payload = &packet[HEADER_LEN..];
                write_plane_samples(payload, bit_mode, planes, plane, &mut out[dst_base..], &mut dst_idx);
            }
        }
    });
}

/// Copy every `plane`-th component (or pair of components, when `planes ==
/// 2`) out of an interleaved X/Y re/im payload into `dst`, starting at
/// `*dst_idx`, unpacking 4-bit samples to 8-bit as it goes.
fn write_plane_samples(payload: &[u8], bit_mode: u8, planes: usize, plane: usize, dst: &mut [u8], dst_idx: &mut usize) {
    let components_per_sample = 4usize; // Xre, Xim, Yre, Yim
    match bit_mode {
        0 | 1 => {
            let sample_bytes = crate::constants::bytes_per_sample_rounded(bit_mode);
            let stride = components_per_sample * sample_bytes;
            let components_in_plane = if planes == 4 { 1 } else { 2 };
            let start_component = if planes == 4 { plane } else { plane * 2 };
            let mut src = 0;
            while src + stride <= payload.len() {
                for c in 0..components_in_plane {
                    let off = src + (start_component + c) * sample_bytes;
                    dst[*dst_idx..*dst_idx + sample_bytes].copy_from_slice(&payload[off..off + sample_bytes]);
                    *dst_idx += sample_bytes;
                }
                src += stride;
            }
        }
        2 => {
            // 4-bit: each byte packs two components' worth of nibbles.
            let components_in_plane = if planes == 4 { 1 } else { 2 };
            let start_component = if planes == 4 { plane } else { plane * 2 };
            let mut src_byte = 0;
            while src_byte + 2 <= payload.len() {
                let (lo0, hi0) = unpack_4bit(payload[src_byte]);
                let (lo1, hi1) = unpack_4bit(payload[src_byte + 1]);
                let unpacked = [lo0, hi0, lo1, hi1];
                for c in 0..components_in_plane {
                    dst[*dst_idx] = unpacked[start_component + c] as u8;
                    *dst_idx += 1;
                }
                src_byte += 2;
            }
        }
        other => panic!("illegal bit mode {other} reached write_plane_samples"),
    }
}
