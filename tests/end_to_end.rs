//! End-to-end scenarios driven against real files on disk, through the
//! public `Session`/`Reader` API only -- no internal module is reached into.

use std::path::Path;

use anyhow::Result;
use tempfile::tempdir;

use lofar_reader::constants::{
    COMPLEX_COMPONENTS, HEADER_LEN, LOFAR_EPOCH, POLARISATIONS, TIMESLICES_PER_PACKET,
};
use lofar_reader::reader::{Reader, TolerableResult};
use lofar_reader::session::{Session, SessionConfig};
use lofar_reader::transport::ReaderType;

const BASE_TIMESTAMP: u32 = LOFAR_EPOCH + 1;

/// Build one packet: a 16-byte header plus a zeroed payload sized the same
/// way `packet::parse_headers` derives it, with `fill` given a chance to
/// stamp sample data into the payload before the packet is returned.
///
/// `rel` packets built with the same `timestamp`/`bit_mode` and consecutive
/// `rel` values produce consecutive `packet_number()`s: the 160 MHz clock
/// rate divides evenly by the 16 timeslices per packet, so stepping the
/// sequence counter by 16 steps the packet number by exactly one.
fn build_packet(rel: u32, bit_mode: u8, beamlets: u16, mut fill: impl FnMut(&mut [u8])) -> Vec<u8> {
    let mut source = 0u8;
    source |= (bit_mode & 0b11) << 5;
    // station id 0, clock bit unset (160 MHz)

    let mut packet = vec![0u8; HEADER_LEN];
    packet[0] = 2; // version
    packet[1] = source;
    packet[4..8].copy_from_slice(&BASE_TIMESTAMP.to_le_bytes());
    packet[8..12].copy_from_slice(&(rel * TIMESLICES_PER_PACKET).to_le_bytes());
    packet[12..14].copy_from_slice(&beamlets.to_le_bytes());
    packet[14..16].copy_from_slice(&(TIMESLICES_PER_PACKET as u16).to_le_bytes());

    let (num, den) = match bit_mode {
        0 => (2u32, 1u32),
        1 => (1, 1),
        other => panic!("test helper doesn't support bit mode {other}"),
    };
    let payload_bits = beamlets as u64
        * TIMESLICES_PER_PACKET as u64
        * POLARISATIONS as u64
        * COMPLEX_COMPONENTS as u64
        * num as u64;
    let payload_bytes = (payload_bits as usize).div_ceil(den as usize);
    packet.resize(HEADER_LEN + payload_bytes, 0);

    fill(&mut packet[HEADER_LEN..]);
    packet
}

/// Fill an entire 8-bit-mode payload with one repeated marker byte, so a
/// slot's origin packet can be identified by inspecting any byte of it.
fn marker_fill(marker: u8) -> impl FnMut(&mut [u8]) {
    move |payload: &mut [u8]| payload.fill(marker)
}

fn write_packets(dir: &Path, name: &str, packets: &[Vec<u8>]) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    let mut bytes = Vec::new();
    for p in packets {
        bytes.extend_from_slice(p);
    }
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn base_config(port_paths: Vec<std::path::PathBuf>, ppi: usize, mode: u32) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.num_ports = port_paths.len();
    config.port_paths = port_paths;
    config.reader_type = ReaderType::Raw;
    config.packets_per_iteration = ppi;
    config.processing_mode = mode;
    config
}

/// `Reader::setup` already consumes one full window of packets to establish
/// the initial buffer (mirroring the source's priming read); the output a
/// caller actually observes comes from the window the first `step()` reads,
/// which is the *second* physical window on disk. Every test below supplies
/// a throwaway first window for that reason.
fn filler_window(ppi: usize, bit_mode: u8, beamlets: u16) -> Vec<Vec<u8>> {
    (0..ppi as u32)
        .map(|rel| build_packet(rel, bit_mode, beamlets, marker_fill(0)))
        .collect()
}

#[test]
fn no_op_copy_mode_zero_is_byte_identical() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 4usize;
    let beamlets = 1u16;

    let mut packets = filler_window(ppi, 1, beamlets);
    let window1: Vec<Vec<u8>> = (0..ppi as u32)
        .map(|i| build_packet(ppi as u32 + i, 1, beamlets, marker_fill(10 + i as u8)))
        .collect();
    packets.extend(window1.iter().cloned());

    let path = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let config = base_config(vec![path], ppi, 0);

    let mut session = Session::setup(config)?;
    let outcome = session.step()?;
    assert_eq!(outcome, TolerableResult::Ok);

    let outputs = session.outputs()?;
    assert_eq!(outputs.len(), 1);
    let packet_len = window1[0].len();
    assert_eq!(outputs[0].len(), packet_len * ppi);
    for (slot, want) in window1.iter().enumerate() {
        let got = &outputs[0][slot * packet_len..(slot + 1) * packet_len];
        assert_eq!(got, want.as_slice(), "slot {slot} mismatch");
    }
    session.cleanup();
    Ok(())
}

#[test]
fn mode_one_drops_header_byte_identical_to_payload() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 4usize;
    let beamlets = 1u16;

    let mut packets = filler_window(ppi, 1, beamlets);
    let window1: Vec<Vec<u8>> = (0..ppi as u32)
        .map(|i| build_packet(ppi as u32 + i, 1, beamlets, marker_fill(50 + i as u8)))
        .collect();
    packets.extend(window1.iter().cloned());

    let path = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let config = base_config(vec![path], ppi, 1);

    let mut reader = Reader::setup(config)?;
    let outcome = reader.step()?;
    assert_eq!(outcome, TolerableResult::Ok);

    let outputs = reader.outputs();
    let payload_len = window1[0].len() - HEADER_LEN;
    assert_eq!(outputs[0].len(), payload_len * ppi);
    for (slot, want) in window1.iter().enumerate() {
        let got = &outputs[0][slot * payload_len..(slot + 1) * payload_len];
        assert_eq!(got, &want[HEADER_LEN..], "slot {slot} mismatch");
    }
    Ok(())
}

#[test]
fn dropped_packet_is_replayed_from_preceding_slot() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 4usize;
    let beamlets = 1u16;

    let mut packets = filler_window(ppi, 1, beamlets);
    // Window 1 spans rel = ppi..ppi+3 (4 consecutive numbers); rel = ppi + 2
    // (the third of those) is never written, leaving a one-packet hole.
    let base = ppi as u32;
    packets.push(build_packet(base, 1, beamlets, marker_fill(101)));
    packets.push(build_packet(base + 1, 1, beamlets, marker_fill(102)));
    // gap: base + 2 missing
    packets.push(build_packet(base + 3, 1, beamlets, marker_fill(104)));

    let path = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let mut config = base_config(vec![path], ppi, 1);
    config.replay_dropped_packets = true;

    let mut reader = Reader::setup(config)?;
    reader.step()?;

    let outputs = reader.outputs();
    let payload_len = beamlets as usize * TIMESLICES_PER_PACKET as usize * POLARISATIONS as usize
        * COMPLEX_COMPONENTS as usize;
    let slot = |s: usize| &outputs[0][s * payload_len..(s + 1) * payload_len];

    assert!(slot(0).iter().all(|&b| b == 101));
    assert!(slot(1).iter().all(|&b| b == 102));
    assert!(slot(2).iter().all(|&b| b == 102), "replayed slot should repeat slot 1's payload");
    assert!(slot(3).iter().all(|&b| b == 104));
    Ok(())
}

#[test]
fn dropped_packet_is_zero_filled_when_replay_disabled() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 4usize;
    let beamlets = 1u16;

    let mut packets = filler_window(ppi, 1, beamlets);
    let base = ppi as u32;
    packets.push(build_packet(base, 1, beamlets, marker_fill(201)));
    packets.push(build_packet(base + 1, 1, beamlets, marker_fill(202)));
    packets.push(build_packet(base + 3, 1, beamlets, marker_fill(204)));

    let path = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let mut config = base_config(vec![path], ppi, 1);
    config.replay_dropped_packets = false;

    let mut reader = Reader::setup(config)?;
    reader.step()?;

    let outputs = reader.outputs();
    let payload_len = beamlets as usize * TIMESLICES_PER_PACKET as usize * POLARISATIONS as usize
        * COMPLEX_COMPONENTS as usize;
    let slot = |s: usize| &outputs[0][s * payload_len..(s + 1) * payload_len];

    assert!(slot(0).iter().all(|&b| b == 201));
    assert!(slot(1).iter().all(|&b| b == 202));
    assert!(slot(2).iter().all(|&b| b == 0), "zero-filled slot should be all zero");
    assert!(slot(3).iter().all(|&b| b == 204));
    Ok(())
}

#[test]
fn packets_per_iteration_of_two_is_the_minimum_supported_window() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 2usize;
    let beamlets = 1u16;

    let mut packets = filler_window(ppi, 1, beamlets);
    packets.push(build_packet(ppi as u32, 1, beamlets, marker_fill(7)));
    packets.push(build_packet(ppi as u32 + 1, 1, beamlets, marker_fill(8)));

    let path = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let config = base_config(vec![path], ppi, 0);

    let mut session = Session::setup(config)?;
    let outcome = session.step()?;
    assert_eq!(outcome, TolerableResult::Ok);
    assert_eq!(session.outputs()?[0].len(), (HEADER_LEN + 64) * ppi);
    Ok(())
}

/// Stokes I on a single beamlet with one non-trivial timeslice: X = 3+4i,
/// Y = 0+2i gives I = |X|^2 + |Y|^2 = 25 + 4 = 29; every other timeslice is
/// all-zero samples and so reads back as I = 0.
#[test]
fn stokes_i_matches_power_sum_formula() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 2usize;
    let beamlets = 1u16;

    let fill_known = |payload: &mut [u8]| {
        let samples: [(i16, i16, i16, i16); 16] = {
            let mut s = [(0i16, 0i16, 0i16, 0i16); 16];
            s[0] = (3, 4, 0, 2);
            s
        };
        for (ts, &(xre, xim, yre, yim)) in samples.iter().enumerate() {
            let base = ts * 8;
            payload[base..base + 2].copy_from_slice(&xre.to_le_bytes());
            payload[base + 2..base + 4].copy_from_slice(&xim.to_le_bytes());
            payload[base + 4..base + 6].copy_from_slice(&yre.to_le_bytes());
            payload[base + 6..base + 8].copy_from_slice(&yim.to_le_bytes());
        }
    };

    let mut packets = filler_window(ppi, 0, beamlets);
    packets.push(build_packet(ppi as u32, 0, beamlets, fill_known));
    packets.push(build_packet(ppi as u32 + 1, 0, beamlets, fill_known));

    let path = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let config = base_config(vec![path], ppi, 100);

    let mut reader = Reader::setup(config)?;
    reader.step()?;

    let outputs = reader.outputs();
    assert_eq!(outputs.len(), 1);
    let out_ts = TIMESLICES_PER_PACKET as usize;
    for slot in 0..ppi {
        let base = slot * out_ts * 4;
        let v0 = f32::from_le_bytes(outputs[0][base..base + 4].try_into().unwrap());
        assert!((v0 - 29.0).abs() < 1e-3, "slot {slot} timeslice 0: got {v0}, want 29.0");
        for ts in 1..out_ts {
            let off = base + ts * 4;
            let v = f32::from_le_bytes(outputs[0][off..off + 4].try_into().unwrap());
            assert!(v.abs() < 1e-3, "slot {slot} timeslice {ts}: got {v}, want 0.0");
        }
    }
    Ok(())
}

#[test]
fn short_read_narrows_the_window_and_reports_io_short_read() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 8usize;
    let beamlets = 1u16;

    // Port 0: enough for setup's priming window plus two full steps (24
    // packets). Port 1: enough for the priming window plus one full step
    // plus a two-packet remainder (18 packets), forcing the second step to
    // come up short.
    let port0: Vec<Vec<u8>> = (0..24u32)
        .map(|rel| build_packet(rel, 1, beamlets, marker_fill((rel % 250) as u8)))
        .collect();
    let port1: Vec<Vec<u8>> = (0..18u32)
        .map(|rel| build_packet(rel, 1, beamlets, marker_fill((rel % 250) as u8)))
        .collect();

    let path0 = write_packets(tmpd.path(), "port0.bin", &port0)?;
    let path1 = write_packets(tmpd.path(), "port1.bin", &port1)?;
    let config = base_config(vec![path0, path1], ppi, 0);

    let mut reader = Reader::setup(config)?;

    let first = reader.step()?;
    assert_eq!(first, TolerableResult::Ok);
    assert_eq!(reader.packets_per_iteration(), ppi);

    let second = reader.step()?;
    assert_eq!(second, TolerableResult::IoShortRead);
    assert_eq!(reader.packets_per_iteration(), 2);
    Ok(())
}

#[test]
fn starting_packet_alignment_synchronizes_multiple_ports_with_no_loss() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 4usize;
    let beamlets = 1u16;
    let rel_target = 12u32;

    // Computed from a throwaway packet so the target is always the real
    // packet number of `rel_target`, never a hand-derived constant.
    let target =
        lofar_reader::packet::HeaderView::new(&build_packet(rel_target, 1, beamlets, marker_fill(0)))
            .packet_number();

    let packets: Vec<Vec<u8>> = (0..=20u32)
        .map(|rel| build_packet(rel, 1, beamlets, marker_fill(rel as u8)))
        .collect();

    let path0 = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let path1 = write_packets(tmpd.path(), "port1.bin", &packets)?;
    let mut config = base_config(vec![path0, path1], ppi, 1);
    config.starting_packet = target;

    let mut reader = Reader::setup(config)?;
    // Alignment has already materialized the target window in each port's
    // buffer, but it hasn't been exposed as output yet.
    assert_eq!(reader.packets_read(), 0);
    assert_eq!(reader.last_packet(), target - 1);

    let outcome = reader.step()?;
    assert_eq!(outcome, TolerableResult::Ok);
    assert_eq!(reader.packets_read(), ppi as u64);
    assert_eq!(reader.last_packet(), target - 1 + ppi as i64);

    let outputs = reader.outputs();
    assert_eq!(outputs.len(), 2);
    let payload_len = build_packet(0, 1, beamlets, marker_fill(0)).len() - HEADER_LEN;
    for port_out in outputs {
        for i in 0..ppi {
            let want = (rel_target as usize + i) as u8;
            let got = &port_out[i * payload_len..(i + 1) * payload_len];
            assert!(got.iter().all(|&b| b == want), "slot {i}: want marker {want}, got {:?}", got[0]);
        }
    }
    Ok(())
}

#[test]
fn starting_packet_alignment_absorbs_a_lost_target_packet() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 4usize;
    let beamlets = 1u16;
    let missing_rel = 14u32;

    // The requested target packet is never written to disk; alignment must
    // land one packet number past it instead of failing.
    let target =
        lofar_reader::packet::HeaderView::new(&build_packet(missing_rel, 1, beamlets, marker_fill(0)))
            .packet_number();

    let packets: Vec<Vec<u8>> = (0..=22u32)
        .filter(|&rel| rel != missing_rel)
        .map(|rel| build_packet(rel, 1, beamlets, marker_fill(rel as u8)))
        .collect();

    let path = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let mut config = base_config(vec![path], ppi, 1);
    config.starting_packet = target;
    config.replay_dropped_packets = true;

    let mut reader = Reader::setup(config)?;
    assert_eq!(reader.packets_read(), 0);
    assert_eq!(reader.last_packet(), target);

    let outcome = reader.step()?;
    assert_eq!(outcome, TolerableResult::Ok);
    assert_eq!(reader.packets_read(), ppi as u64);
    assert_eq!(reader.last_packet(), target + ppi as i64);

    let outputs = reader.outputs();
    let payload_len = build_packet(0, 1, beamlets, marker_fill(0)).len() - HEADER_LEN;
    for i in 0..ppi {
        let want = (missing_rel as usize + 1 + i) as u8;
        let got = &outputs[0][i * payload_len..(i + 1) * payload_len];
        assert!(got.iter().all(|&b| b == want), "slot {i}: want marker {want}");
    }
    Ok(())
}

#[test]
fn packets_read_accumulates_and_drops_are_counted_once() -> Result<()> {
    let tmpd = tempdir()?;
    let ppi = 4usize;
    let beamlets = 1u16;

    let mut packets = filler_window(ppi, 1, beamlets);
    let base = ppi as u32;
    packets.push(build_packet(base, 1, beamlets, marker_fill(1)));
    packets.push(build_packet(base + 1, 1, beamlets, marker_fill(2)));
    // gap: base + 2 missing
    packets.push(build_packet(base + 3, 1, beamlets, marker_fill(3)));
    for i in 0..(ppi as u32) {
        packets.push(build_packet(base + 4 + i, 1, beamlets, marker_fill(4)));
    }

    let path = write_packets(tmpd.path(), "port0.bin", &packets)?;
    let mut config = base_config(vec![path], ppi, 0);
    config.replay_dropped_packets = true;

    let mut reader = Reader::setup(config)?;

    reader.step()?;
    assert_eq!(reader.packets_read(), ppi as u64);
    assert_eq!(reader.cumulative_dropped(), vec![1u64]);

    reader.step()?;
    assert_eq!(reader.packets_read(), 2 * ppi as u64);
    assert_eq!(reader.cumulative_dropped(), vec![1u64], "second window has no further loss");
    Ok(())
}
