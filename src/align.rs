//! Alignment engine (C4): skip every port forward until a target packet
//! number lies within its window, then binary-search the exact offset.

use crate::error::{Error, Result};
use crate::reader::{PortState, TolerableResult};

/// Outcome of [`skip_to_packet`] for one call.
pub struct AlignOutcome {
    /// Final within-window offset found for each port (logical index of
    /// the first packet with number >= target).
    pub offsets: Vec<usize>,
}

/// Advance every port until `target` lies in its window, then binary-search
/// the exact offset per port. See the design doc §4.4 for the algorithm.
///
/// `read_step` is called to fan out a read across all ports in lock-step;
/// it's injected as a closure so this module doesn't need to know about the
/// rest of the reader's internals beyond [`PortState`].
pub fn skip_to_packet(
    ports: &mut [PortState],
    target: i64,
    mut read_step: impl FnMut(&mut [PortState]) -> Result<TolerableResult>,
) -> Result<AlignOutcome> {
    // Step 1: verify every port hasn't already passed the target.
    for (p, port) in ports.iter().enumerate() {
        let first = port.buffer.packet_at(0);
        let num = crate::packet::HeaderView::new(first).packet_number();
        if num > target {
            return Err(Error::TargetInPast {
                port: p,
                target,
                current: num,
            });
        }
    }

    // Step 2/3: advance ports in lock-step until target lies in every
    // window. Per-slot loss is resolved inside `read_step` itself (gaps are
    // detected by packet number, not inferred from a trailing deficit), so
    // this loop only needs to watch the window's last slot.
    loop {
        let all_reached = ports.iter().all(|port| {
            let ppi = port.buffer.packets_per_iteration();
            let last_num =
                crate::packet::HeaderView::new(port.buffer.packet_at(ppi as isize - 1)).packet_number();
            last_num >= target
        });
        if all_reached {
            break;
        }

        log::debug!("skip_to_packet: advancing toward target {target}");
        read_step(ports)?;
    }

    // Step 4: per-port binary search for the exact offset.
    let mut offsets = Vec::with_capacity(ports.len());
    for port in ports.iter_mut() {
        let ppi = port.buffer.packets_per_iteration();
        let first_num = crate::packet::HeaderView::new(port.buffer.packet_at(0)).packet_number();
        let mut search_target = target;
        let mut start = (search_target - first_num).max(0) as i64;
        let mut end = ppi as i64;

        let mid = loop {
            if start > end {
                // Degenerate search: the exact target packet is itself lost.
                // Widen the window and retry with target+1, per §4.4.
                search_target += 1;
                start = (start - 10).max(0);
                end = (end + 10).min(ppi as i64);
                continue;
            }
            let probe = (start + end) / 2;
            if probe < 0 || probe >= ppi as i64 {
                search_target += 1;
                start = (start - 10).max(0);
                end = (end + 10).min(ppi as i64);
                continue;
            }
            let probe_num = crate::packet::HeaderView::new(port.buffer.packet_at(probe as isize))
                .packet_number();
            if probe_num == search_target {
                break probe;
            } else if probe_num < search_target {
                start = probe + 1;
            } else {
                end = probe - 1;
            }
        };

        let shift = ppi as i64 - mid;
        offsets.push(mid as usize);
        port.pending_shift = shift.max(0) as usize;
        port.next_expected = search_target;
    }

    Ok(AlignOutcome { offsets })
}

/// Final cleanup pass: repeat the skip from the per-port maximum observed
/// packet number, to remove any residual up-to-one-packet deltas between
/// ports left over from the main skip.
pub fn first_packet_alignment(
    ports: &mut [PortState],
    mut read_step: impl FnMut(&mut [PortState]) -> Result<TolerableResult>,
) -> Result<AlignOutcome> {
    // `next_expected` was set by the main skip to the packet number it
    // actually landed on for each port (the requested target, or target + 1
    // if the target itself was lost and the degenerate-search fallback
    // kicked in) -- that, not the window's current front slot, is what a
    // residual per-port delta needs to be measured against.
    let max_first = ports.iter().map(|p| p.next_expected).max().unwrap_or(0);
    skip_to_packet(ports, max_first, &mut read_step)
}
