//! Stokes parameter kernels: polarimetric combination of the X/Y complex
//! pair into I/Q/U/V, with optional calibration and time decimation.

use num_complex::Complex;
use rayon::prelude::*;

use super::ProcessingMode;
use crate::calibration::CalibrationSource;
use crate::constants::{POLARISATIONS, TIMESLICES_PER_PACKET};
use crate::error::Result;
use crate::packet::Geometry;
use crate::reader::PortState;
use crate::session::SessionConfig;

/// Which Stokes parameter a single-output kernel computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StokesComponent {
    I,
    Q,
    U,
    V,
}

fn stokes(x: Complex<f32>, y: Complex<f32>, which: StokesComponent) -> f32 {
    match which {
        StokesComponent::I => x.norm_sqr() + y.norm_sqr(),
        StokesComponent::Q => x.norm_sqr() - y.norm_sqr(),
        StokesComponent::U => 2.0 * (x * y.conj()).re,
        StokesComponent::V => 2.0 * (x * y.conj()).im,
    }
}

fn apply_jones(jones: [Complex<f32>; 4], x: Complex<f32>, y: Complex<f32>) -> (Complex<f32>, Complex<f32>) {
    let [xx, xy, yx, yy] = jones;
    (xx * x + xy * y, yx * x + yy * y)
}

fn beamlet_location(geometry: &Geometry, global_idx: u32) -> (usize, u32) {
    for port in 0..geometry.port_raw_beamlets.len() {
        let port_lo_raw = geometry.port_raw_cumulative_beamlets[port];
        let port_hi_raw = port_lo_raw + geometry.port_raw_beamlets[port];
        let clipped_lo = geometry.base_beamlets.max(port_lo_raw).min(port_hi_raw);
        let clipped_hi = geometry.upper_beamlets.min(port_hi_raw).max(port_lo_raw);
        let count = clipped_hi.saturating_sub(clipped_lo);
        let proc_lo = geometry.port_cumulative_beamlets[port];
        let proc_hi = proc_lo + count;
        if global_idx >= proc_lo && global_idx < proc_hi {
            return (port, clipped_lo - port_lo_raw + (global_idx - proc_lo));
        }
    }
    panic!("beamlet index {global_idx} out of range for geometry");
}

/// Read the X/Y complex pair for one (beamlet, timeslice) out of a packet's
/// payload, unpacking 4-bit samples as needed. Payload layout is
/// beamlet-major, timeslice-minor, `[Xre, Xim, Yre, Yim]` per slot.
fn read_xy(payload: &[u8], bit_mode: u8, raw_beamlet: u32, timeslice: usize) -> (Complex<f32>, Complex<f32>) {
    let ts = TIMESLICES_PER_PACKET as usize;
    let pols = POLARISATIONS as usize;
    match bit_mode {
        0 => {
            let stride = pols * 2 * 2; // 2 bytes/sample
            let base = raw_beamlet as usize * ts * stride + timeslice * stride;
            let s = |i: usize| i16::from_le_bytes([payload[base + i * 2], payload[base + i * 2 + 1]]) as f32;
            (Complex::new(s(0), s(1)), Complex::new(s(2), s(3)))
        }
        1 => {
            let stride = pols * 2;
            let base = raw_beamlet as usize * ts * stride + timeslice * stride;
            let s = |i: usize| payload[base + i] as i8 as f32;
            (Complex::new(s(0), s(1)), Complex::new(s(2), s(3)))
        }
        2 => {
            let nibbles_per_slot = pols * 2;
            let base_nibble = raw_beamlet as usize * ts * nibbles_per_slot + timeslice * nibbles_per_slot;
            let nibble = |n: usize| {
                let byte = payload[(base_nibble + n) / 2];
                let v = if (base_nibble + n) % 2 == 0 { byte & 0x0f } else { (byte >> 4) & 0x0f } as i8;
                (if v & 0x08 != 0 { v | !0x0f } else { v }) as f32
            };
            (Complex::new(nibble(0), nibble(1)), Complex::new(nibble(2), nibble(3)))
        }
        other => panic!("illegal bit mode {other} reached read_xy"),
    }
}

/// `fill_port_window` already resolves every slot -- real, replayed, or
/// zeroed -- in place before a read completes, so kernels never need to
/// re-derive which slots were substitutes from a trailing deficit count.
fn packet_payload(port: &PortState, slot: usize) -> &[u8] {
    &port.buffer.packet_at(slot as isize)[crate::constants::HEADER_LEN..]
}

/// Compute the calibrated (if enabled) X/Y pair for one absolute sample.
#[allow(clippy::too_many_arguments)]
fn sample_xy(
    ports: &[PortState],
    geometry: &Geometry,
    slot: usize,
    global_beamlet: u32,
    timeslice: usize,
    calibration: Option<&CalibrationSource>,
    calibration_step: u64,
) -> (Complex<f32>, Complex<f32>) {
    let (port_idx, raw_beamlet) = beamlet_location(geometry, global_beamlet);
    let payload = packet_payload(&ports[port_idx], slot);
    let (x, y) = read_xy(payload, geometry.bit_mode, raw_beamlet, timeslice);
    match calibration {
        Some(cal) => {
            let abs_t = calibration_step + (slot * TIMESLICES_PER_PACKET as usize + timeslice) as u64;
            let jones = cal.jones_at(abs_t, global_beamlet as usize);
            apply_jones(jones, x, y)
        }
        None => (x, y),
    }
}

fn write_f32(out: &mut [u8], offset: usize, value: f32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
pub fn single_component(
    which: StokesComponent,
    decimation: u32,
    ports: &[PortState],
    geometry: &Geometry,
    config: &SessionConfig,
    ppi: usize,
    calibration: Option<&CalibrationSource>,
    calibration_step: u64,
    out: &mut Vec<u8>,
) -> Result<()> {
    let out_len = (ProcessingMode::Stokes { which, decimation }).output_shape(geometry, config).1[0];
    out.clear();
    out.resize(out_len * ppi, 0);

    let ts = TIMESLICES_PER_PACKET as usize;
    let out_ts = (ts / decimation as usize).max(1);
    let total_beamlets = geometry.total_proc_beamlets();

    out.par_chunks_mut(out_len).enumerate().for_each(|(slot, out_slot)| {
        for beamlet in 0..total_beamlets {
            for ot in 0..out_ts {
                let mut acc = 0.0f32;
                for d in 0..decimation as usize {
                    let timeslice = ot * decimation as usize + d;
                    if timeslice >= ts {
                        break;
                    }
                    let (x, y) = sample_xy(ports, geometry, slot, beamlet, timeslice, calibration, calibration_step);
                    acc += stokes(x, y, which);
                }
                let value = acc / decimation as f32;
                let offset = (beamlet as usize * out_ts + ot) * 4;
                write_f32(out_slot, offset, value);
            }
        }
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn all_components(
    decimation: u32,
    ports: &[PortState],
    geometry: &Geometry,
    config: &SessionConfig,
    ppi: usize,
    calibration: Option<&CalibrationSource>,
    calibration_step: u64,
    outputs: &mut [Vec<u8>],
) -> Result<()> {
    let components = [StokesComponent::I, StokesComponent::Q, StokesComponent::U, StokesComponent::V];
    for (out, which) in outputs.iter_mut().zip(components.iter()) {
        single_component(*which, decimation, ports, geometry, config, ppi, calibration, calibration_step, out)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn two_components(
    decimation: u32,
    ports: &[PortState],
    geometry: &Geometry,
    config: &SessionConfig,
    ppi: usize,
    calibration: Option<&CalibrationSource>,
    calibration_step: u64,
    outputs: &mut [Vec<u8>],
) -> Result<()> {
    let components = [StokesComponent::I, StokesComponent::V];
    for (out, which) in outputs.iter_mut().zip(components.iter()) {
        single_component(*which, decimation, ports, geometry, config, ppi, calibration, calibration_step, out)?;
    }
    Ok(())
}
