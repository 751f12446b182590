//! Reader orchestrator (C5): owns all ports, issues parallel reads,
//! performs the inter-iteration shift, and drives the alignment engine.

use std::sync::Mutex;

use crate::align;
use crate::calibration::CalibrationSource;
use crate::error::{Error, Result};
use crate::kernels::ProcessingMode;
use crate::packet::{Geometry, HeaderView};
use crate::port_buffer::PortBuffer;
use crate::session::SessionConfig;
use crate::transport::{self, Transport, TransportOpenParams};

/// A tolerable (non-fatal) outcome of a `step()`/`readStep` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TolerableResult {
    /// Nothing unusual; the full requested window was produced.
    Ok,
    /// At least one port returned fewer bytes than requested; the window
    /// was narrowed to the shortest successful read.
    IoShortRead,
    /// `packetsReadMax` was reached; the caller should stop stepping.
    PacketCapReached,
}

/// Per-port mutable state owned by the reader.
pub struct PortState {
    pub(crate) buffer: PortBuffer,
    pub(crate) transport: Box<dyn Transport>,
    /// Packets dropped (missing) in the most recently completed window.
    pub(crate) last_dropped_packets: usize,
    /// Cumulative packets dropped over the life of the session.
    pub(crate) cumulative_dropped: u64,
    /// Packet number of the last packet this port has seen (index 0 - 1
    /// before the first read; updated after every successful window).
    pub(crate) last_packet_seen: i64,
    /// Shift computed by the alignment engine, pending application.
    pub(crate) pending_shift: usize,
    /// Expected packet number of logical slot 0 of the window currently
    /// being filled. Advances by however many logical slots the previous
    /// fill actually resolved (gap-compensated slots included, a
    /// short-read tail excluded).
    pub(crate) next_expected: i64,
}

/// Timings for one `step_timed` call: `[read_duration, kernel_duration]`.
pub type StepTimings = [std::time::Duration; 2];

/// The reader orchestrator. Constructed by [`crate::session::Session::setup`];
/// not meant to be used directly by most callers.
pub struct Reader {
    ports: Vec<PortState>,
    geometry: Geometry,
    mode: ProcessingMode,
    config: SessionConfig,
    pool: rayon::ThreadPool,
    packets_per_iteration: usize,
    packets_read: u64,
    packets_read_max: i64,
    outputs: Vec<Vec<u8>>,
    output_packet_len: Vec<usize>,
    calibration: Option<CalibrationSource>,
    calibration_step: u64,
    /// Set once alignment has materialized a window starting exactly at the
    /// requested target but no `step()` has consumed it yet. The bytes for
    /// that window are already read off the transports (the scan that found
    /// the target necessarily consumed them); the next `read_step` must use
    /// them as-is rather than discarding them for a fresh read.
    pending_aligned_window: bool,
}

impl Reader {
    /// Open transports for every port, parse the first headers, derive
    /// geometry, allocate buffers, and perform the first read. If
    /// `config.starting_packet` is set, run the alignment engine.
    pub fn setup(config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads())
            .build()
            .map_err(|e| Error::fatal(format!("building worker pool: {e}")))?;

        let mut transports: Vec<Box<dyn Transport>> = Vec::with_capacity(config.num_ports);
        for i in 0..config.num_ports {
            let params = TransportOpenParams {
                port_index: i,
                path: config.port_paths.get(i).cloned(),
                ring_buffer_base_key: config.ring_buffer_base_key,
                ring_buffer_key_stride: config.ring_buffer_key_stride,
                known_packet_len: None,
            };
            transports.push(transport::open(config.reader_type, params)?);
        }

        let mut first_headers = Vec::with_capacity(config.num_ports);
        for t in &mut transports {
            first_headers.push(t.peek_header(16)?);
        }
        let header_refs: Vec<&[u8]> = first_headers.iter().map(|v| v.as_slice()).collect();
        let geometry = crate::packet::parse_headers(&header_refs, config.beamlet_limits)?;
        if geometry.mixed_packet_lengths {
            log::warn!("ports report mixed packet lengths");
        }

        let mode = ProcessingMode::from_mode_id(config.processing_mode, config.calibrate_data)?;

        let mut ports = Vec::with_capacity(config.num_ports);
        for (i, transport) in transports.into_iter().enumerate() {
            let packet_len = geometry.port_packet_length[i];
            let mut buffer = PortBuffer::new(packet_len, config.packets_per_iteration, 4096);
            // Seed index -1/-2 guard slots so early replay/zero-fill has
            // something well-defined before any real loss is observed.
            buffer.zero_padding_slot();
            let next_expected = HeaderView::new(&first_headers[i]).packet_number();
            ports.push(PortState {
                buffer,
                transport,
                last_dropped_packets: 0,
                cumulative_dropped: 0,
                last_packet_seen: -1,
                pending_shift: 0,
                next_expected,
            });
        }

        let mut reader = Self {
            ports,
            geometry,
            mode,
            config: config.clone(),
            pool,
            packets_per_iteration: config.packets_per_iteration,
            packets_read: 0,
            packets_read_max: if config.packets_read_max < 0 {
                i64::MAX
            } else {
                config.packets_read_max
            },
            outputs: Vec::new(),
            output_packet_len: Vec::new(),
            calibration: None,
            calibration_step: 0,
            pending_aligned_window: false,
        };

        reader.allocate_outputs();
        reader.first_read()?;

        if config.starting_packet >= crate::constants::LOFAR_EPOCH as i64 {
            let outcome = align::skip_to_packet(&mut reader.ports, config.starting_packet, |ports| {
                reader_step_for_align(ports, &reader.config, reader.packets_per_iteration)
            })?;
            let _ = outcome;
            let outcome2 = align::first_packet_alignment(&mut reader.ports, |ports| {
                reader_step_for_align(ports, &reader.config, reader.packets_per_iteration)
            })?;
            let _ = outcome2;
            reader.apply_pending_shift_and_refill()?;
        }

        if config.calibrate_data {
            let cal_config = config
                .calibration_configuration
                .clone()
                .ok_or_else(|| Error::config_invalid("calibrateData set without calibrationConfiguration"))?;
            reader.calibration = Some(CalibrationSource::start(
                cal_config,
                reader.geometry.total_proc_beamlets() as usize,
                reader.geometry.station_id.to_string(),
            )?);
        }

        Ok(reader)
    }

    fn allocate_outputs(&mut self) {
        let (num_outputs, packet_lens) = self.mode.output_shape(&self.geometry, &self.config);
        self.outputs = (0..num_outputs)
            .map(|o| vec![0u8; packet_lens[o] * self.packets_per_iteration])
            .collect();
        self.output_packet_len = packet_lens;
    }

    fn first_read(&mut self) -> Result<()> {
        self.read_step()?;
        Ok(())
    }

    /// Apply each port's pending alignment shift (carrying already-read
    /// bytes forward to the start of the new window) and fill the rest of
    /// the window from the target offset onward.
    fn apply_pending_shift_and_refill(&mut self) -> Result<()> {
        for port in &mut self.ports {
            let shift = port.pending_shift;
            port.buffer.shift_remainder(shift, 0, 0);
            if shift > 0 {
                port.buffer.stash_replay_candidate((shift - 1) as isize);
            }
        }
        // `pending_shift` doubles as the start slot for the refill below, so
        // it can't be cleared until after that read has consumed it.
        self.read_step_from(|port| port.pending_shift)?;
        for port in &mut self.ports {
            port.pending_shift = 0;
        }

        // The window now sitting in each port's buffer starts exactly at the
        // alignment target and is fully resolved, but no step has "consumed"
        // it yet: back last_packet_seen off by one window so that
        // packets_read/last_packet report the pre-alignment state the caller
        // expects, and flag the window so the next step() uses it directly
        // instead of reading fresh data past it.
        for port in &mut self.ports {
            let first_num = HeaderView::new(port.buffer.packet_at(0)).packet_number();
            port.last_packet_seen = first_num - 1;
        }
        self.pending_aligned_window = true;
        Ok(())
    }

    /// Read the next window of packets for every port in parallel, and
    /// return the tolerable outcome. Every port starts filling from logical
    /// slot 0 -- unless alignment just materialized a window at slot 0
    /// already, in which case that window is used as-is.
    fn read_step(&mut self) -> Result<TolerableResult> {
        if self.pending_aligned_window {
            self.pending_aligned_window = false;
            return self.use_pending_aligned_window();
        }
        self.read_step_from(|_| 0)
    }

    /// Apply the `packetsReadMax` cap to the window alignment already placed
    /// in the buffers, without re-reading anything from the transports.
    fn use_pending_aligned_window(&mut self) -> Result<TolerableResult> {
        self.packets_per_iteration = self.config.packets_per_iteration;

        let mut tolerable = TolerableResult::Ok;
        if self.packets_read + self.packets_per_iteration as u64 > self.packets_read_max as u64 {
            let remaining = (self.packets_read_max as i64 - self.packets_read as i64).max(0) as usize;
            self.packets_per_iteration = remaining;
            tolerable = TolerableResult::PacketCapReached;
        }

        let ppi = self.packets_per_iteration;
        for port in &mut self.ports {
            if ppi > 0 {
                let num = HeaderView::new(port.buffer.packet_at(ppi as isize - 1)).packet_number();
                port.last_packet_seen = num;
            }
        }

        Ok(tolerable)
    }

    /// Read the next window of packets for every port in parallel, starting
    /// each port's fill at a (possibly per-port) logical slot.
    fn read_step_from(&mut self, start_slot: impl Fn(&PortState) -> usize) -> Result<TolerableResult> {
        self.packets_per_iteration = self.config.packets_per_iteration;

        let mut tolerable = TolerableResult::Ok;
        if self.packets_read + self.packets_per_iteration as u64 > self.packets_read_max as u64 {
            let remaining = (self.packets_read_max as i64 - self.packets_read as i64).max(0) as usize;
            self.packets_per_iteration = remaining;
            tolerable = TolerableResult::PacketCapReached;
        }

        let ppi = self.packets_per_iteration;
        let replay = self.config.replay_dropped_packets;
        let shared_min = Mutex::new(ppi);
        let shared_result = Mutex::new(tolerable);

        let ports = &mut self.ports;
        let start_slot = &start_slot;
        self.pool.scope(|scope| {
            for port in ports.iter_mut() {
                let shared_min = &shared_min;
                let shared_result = &shared_result;
                scope.spawn(move |_| {
                    let start = start_slot(port);
                    match fill_port_window(port, ppi, replay, start) {
                        Ok((usable, short)) => {
                            if short {
                                let mut min = shared_min.lock().unwrap();
                                *min = (*min).min(usable);
                                let mut res = shared_result.lock().unwrap();
                                *res = TolerableResult::IoShortRead;
                            }
                        }
                        Err(e) => {
                            log::error!("transport read failed: {e}");
                            let mut res = shared_result.lock().unwrap();
                            *res = TolerableResult::IoShortRead;
                        }
                    }
                });
            }
        });

        self.packets_per_iteration = *shared_min.lock().unwrap();
        let tolerable = *shared_result.lock().unwrap();

        for port in &mut self.ports {
            if self.packets_per_iteration > 0 {
                let ppi = self.packets_per_iteration;
                let num = HeaderView::new(port.buffer.packet_at(ppi as isize - 1)).packet_number();
                port.last_packet_seen = num;
            }
        }

        Ok(tolerable)
    }

    /// Produce the next window of output data.
    pub fn step(&mut self) -> Result<TolerableResult> {
        let tolerable = self.read_step()?;
        self.run_kernel()?;
        self.packets_read += self.packets_per_iteration as u64;
        Ok(tolerable)
    }

    /// Like [`Self::step`], but also reports `[read_duration, kernel_duration]`.
    pub fn step_timed(&mut self) -> Result<(TolerableResult, StepTimings)> {
        let t0 = std::time::Instant::now();
        let tolerable = self.read_step()?;
        let read_duration = t0.elapsed();

        let t1 = std::time::Instant::now();
        self.run_kernel()?;
        let kernel_duration = t1.elapsed();

        self.packets_read += self.packets_per_iteration as u64;
        Ok((tolerable, [read_duration, kernel_duration]))
    }

    fn run_kernel(&mut self) -> Result<()> {
        if self.packets_per_iteration == 0 {
            return Ok(());
        }
        if self.calibration.is_some() && self.calibration_step as usize
            >= self.calibration.as_ref().unwrap().steps_generated()
        {
            self.calibration.as_mut().unwrap().regenerate()?;
            self.calibration_step = 0;
        }
        let cal_step = self.calibration_step;
        crate::kernels::dispatch(
            &self.mode,
            &self.ports,
            &self.geometry,
            &self.config,
            self.packets_per_iteration,
            self.calibration.as_ref(),
            cal_step,
            &self.pool,
            &mut self.outputs,
        )?;
        self.calibration_step += (self.packets_per_iteration as u64)
            * crate::constants::TIMESLICES_PER_PACKET as u64;
        Ok(())
    }

    /// Re-align the reader at a new target packet, resetting counters.
    pub fn reuse(&mut self, new_target: i64, new_max: i64) -> Result<()> {
        self.packets_read = 0;
        self.packets_read_max = if new_max < 0 { i64::MAX } else { new_max };

        let ppi = self.packets_per_iteration;
        let config = self.config.clone();
        align::skip_to_packet(&mut self.ports, new_target, |ports| {
            reader_step_for_align(ports, &config, ppi)
        })?;
        self.apply_pending_shift_and_refill()?;
        Ok(())
    }

    /// Release all ports, buffers, and the calibration matrix table. Safe
    /// to call more than once, or in any state.
    pub fn cleanup(&mut self) {
        for port in &mut self.ports {
            let _ = port.transport.close();
        }
        if let Some(cal) = self.calibration.take() {
            cal.stop();
        }
    }

    /// The output buffers produced by the most recent `step`/`step_timed`.
    pub fn outputs(&self) -> &[Vec<u8>] {
        &self.outputs
    }

    /// Output packet length (bytes) for each output index.
    pub fn output_packet_len(&self) -> &[usize] {
        &self.output_packet_len
    }

    /// Current window size, in packets. May be smaller than the configured
    /// value after a short read or cap narrowing.
    pub fn packets_per_iteration(&self) -> usize {
        self.packets_per_iteration
    }

    /// Total packets consumed since setup or the last `reuse`.
    pub fn packets_read(&self) -> u64 {
        self.packets_read
    }

    /// Packet number of port 0's most recently seen last-slot packet.
    pub fn last_packet(&self) -> i64 {
        self.ports[0].last_packet_seen
    }

    /// Cumulative dropped-packet counters, one per port.
    pub fn cumulative_dropped(&self) -> Vec<u64> {
        self.ports.iter().map(|p| p.cumulative_dropped).collect()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Helper used by both setup-time alignment and `reuse`: fans a read out
/// across all ports without going through `&mut Reader`, since the
/// alignment engine only ever needs [`PortState`] slices.
fn reader_step_for_align(
    ports: &mut [PortState],
    config: &SessionConfig,
    packets_per_iteration: usize,
) -> Result<TolerableResult> {
    let mut tolerable = TolerableResult::Ok;
    for port in ports.iter_mut() {
        let (_, short) = fill_port_window(port, packets_per_iteration, config.replay_dropped_packets, 0)?;
        if short {
            tolerable = TolerableResult::IoShortRead;
        }
    }
    Ok(tolerable)
}

/// Fill logical slots `[start_slot, ppi)` of `port`'s window, reading one
/// packet at a time and peeking each packet's header first so a hole in the
/// wire stream (a packet number that skips ahead of what's expected) can be
/// detected and compensated for in place, without over-reading past it.
///
/// Every resolved slot (real, replayed, or zeroed) is fully materialized
/// into the buffer before this returns -- kernels never need to know which
/// slots were substitutes. Returns `(usable_slots, hit_short_read)`: on a
/// genuine end-of-stream, the fill stops early and `usable_slots` is less
/// than `ppi`; loss never shortens it, only substitutes.
fn fill_port_window(port: &mut PortState, ppi: usize, replay_dropped: bool, start_slot: usize) -> Result<(usize, bool)> {
    let packet_len = port.buffer.packet_len();
    let mut slot = start_slot.min(ppi);
    let mut dropped_count = 0usize;
    let mut short = false;

    while slot < ppi {
        let header = port.transport.peek_header(crate::constants::HEADER_LEN)?;
        if header.len() < crate::constants::HEADER_LEN {
            short = true;
            break;
        }
        let actual_number = HeaderView::new(&header).packet_number();
        let expected_number = port.next_expected + slot as i64;

        if actual_number < expected_number {
            // Stale or duplicate packet (out-of-order arrival): discard it
            // and keep waiting for the packet we actually expect.
            log::warn!(
                "discarding out-of-order packet {actual_number}, expected >= {expected_number}"
            );
            let mut discard = vec![0u8; packet_len];
            let n = port.transport.read_exact(&mut discard)?;
            if n < packet_len {
                short = true;
                break;
            }
            continue;
        }

        let gap = (actual_number - expected_number) as usize;
        if gap > 0 {
            let end = (slot + gap).min(ppi);
            for s in slot..end {
                fill_dropped_slot(port, s, replay_dropped);
                dropped_count += 1;
            }
            slot = end;
            continue;
        }

        let n = {
            let dst = port.buffer.packet_at_mut(slot as isize);
            port.transport.read_exact(dst)?
        };
        if n < packet_len {
            short = true;
            break;
        }
        slot += 1;
    }

    if slot > 0 {
        port.buffer.stash_replay_candidate((slot - 1) as isize);
    }
    port.transport.advise_consumed();
    port.next_expected += slot as i64;
    port.last_dropped_packets = dropped_count;
    port.cumulative_dropped += dropped_count as u64;

    Ok((slot, short))
}

/// Materialize a dropped slot in place: a copy of the immediately preceding
/// resolved slot (chaining correctly through runs of loss) when replay is
/// enabled, or the guard zero packet when it isn't.
fn fill_dropped_slot(port: &mut PortState, slot: usize, replay_dropped: bool) {
    if replay_dropped {
        let src: Vec<u8> = if slot == 0 {
            port.buffer.packet_at(-1).to_vec()
        } else {
            port.buffer.packet_at((slot - 1) as isize).to_vec()
        };
        port.buffer.packet_at_mut(slot as isize).copy_from_slice(&src);
    } else {
        port.buffer.packet_at_mut(slot as isize).fill(0);
    }
}
