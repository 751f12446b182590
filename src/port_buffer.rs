//! Per-port buffer (C3): a sliding window of packets with a guard prefix.
//!
//! Per the redesign note in the design doc, this is a plain owned `Vec<u8>`
//! with a fixed two-packet guard prefix, addressed through signed-offset
//! accessors. No `unsafe`, no raw pointer arithmetic.

/// Number of guard packets kept before logical index 0.
pub const GUARD_PACKETS: usize = 2;

/// A sliding window of packets for one port.
pub struct PortBuffer {
    /// Backing storage. Layout: `[guard(2 packets)][active(packets_per_iteration)][pad]`.
    data: Vec<u8>,
    packet_len: usize,
    packets_per_iteration: usize,
    /// Extra bytes reserved past the active window, for decompression overshoot.
    decompression_round_up: usize,
    /// Byte offset (from the start of the active window) at which the next
    /// read must land.
    input_data_offset: usize,
}

impl PortBuffer {
    /// Allocate a new buffer sized for `packets_per_iteration` packets of
    /// `packet_len` bytes each, plus `decompression_round_up` pad bytes.
    pub fn new(packet_len: usize, packets_per_iteration: usize, decompression_round_up: usize) -> Self {
        let total = (packets_per_iteration + GUARD_PACKETS) * packet_len + decompression_round_up;
        Self {
            data: vec![0u8; total],
            packet_len,
            packets_per_iteration,
            decompression_round_up,
            input_data_offset: 0,
        }
    }

    /// Packet length in bytes for this port.
    pub fn packet_len(&self) -> usize {
        self.packet_len
    }

    /// Current window size, in packets.
    pub fn packets_per_iteration(&self) -> usize {
        self.packets_per_iteration
    }

    fn guard_bytes(&self) -> usize {
        GUARD_PACKETS * self.packet_len
    }

    /// Byte offset (from the start of the active window) the next read
    /// should land at.
    pub fn input_data_offset(&self) -> usize {
        self.input_data_offset
    }

    /// Set the next read landing offset.
    pub fn set_input_data_offset(&mut self, offset: usize) {
        self.input_data_offset = offset;
    }

    /// A mutable slice starting at the active window's byte offset `from`,
    /// running to the end of the allocation. Used by transports for
    /// `readExact` calls.
    pub fn write_region_from(&mut self, from: usize) -> &mut [u8] {
        let start = self.guard_bytes() + from;
        &mut self.data[start..]
    }

    /// Packet slot at signed logical index `i` (negative addresses the
    /// guard region: -1 is the most recent replay packet, -2 is the zero
    /// packet).
    pub fn packet_at(&self, i: isize) -> &[u8] {
        let start = self.offset_of(i);
        &self.data[start..start + self.packet_len]
    }

    /// Mutable packet slot at signed logical index `i`.
    pub fn packet_at_mut(&mut self, i: isize) -> &mut [u8] {
        let start = self.offset_of(i);
        &mut self.data[start..start + self.packet_len]
    }

    fn offset_of(&self, i: isize) -> usize {
        let guard = GUARD_PACKETS as isize;
        let idx = guard + i;
        assert!(idx >= 0, "packet index {i} underflows the guard region");
        idx as usize * self.packet_len
    }

    /// Replace the -1 guard slot (replay-on-loss source) with a copy of the
    /// packet currently at logical index `i`.
    pub fn stash_replay_candidate(&mut self, i: isize) {
        let src = self.offset_of(i);
        let dst = self.offset_of(-1);
        let len = self.packet_len;
        self.data.copy_within(src..src + len, dst);
    }

    /// Zero the -2 guard slot (the zero-fill source for non-replay loss).
    pub fn zero_padding_slot(&mut self) {
        let start = self.offset_of(-2);
        let len = self.packet_len;
        self.data[start..start + len].fill(0);
    }

    /// Shift the tail `shift` packets of the active window back toward the
    /// start, optionally preserving `padding` guard packets ahead of them,
    /// per the shift protocol (§4.6). `extra_tail_bytes` carries forward any
    /// decompression overshoot bytes sitting past the active window.
    ///
    /// Returns the new `input_data_offset`.
    pub fn shift_remainder(&mut self, shift: usize, padding: usize, extra_tail_bytes: usize) -> usize {
        let shift = shift.min(self.packets_per_iteration);
        let src_packets = self.packets_per_iteration.saturating_sub(shift + padding);
        let src_offset = self.guard_bytes() + src_packets * self.packet_len;
        let dst_offset = self.guard_bytes() - padding * self.packet_len;
        let count = (shift + padding) * self.packet_len + extra_tail_bytes;

        let src_end = (src_offset + count).min(self.data.len());
        let count = src_end.saturating_sub(src_offset);
        if count > 0 {
            self.data.copy_within(src_offset..src_end, dst_offset);
        }

        let new_offset = shift * self.packet_len;
        self.input_data_offset = new_offset;
        new_offset
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_region_is_addressable() {
        let mut buf = PortBuffer::new(4, 3, 0);
        buf.packet_at_mut(0).copy_from_slice(&[1, 2, 3, 4]);
        buf.stash_replay_candidate(0);
        assert_eq!(buf.packet_at(-1), &[1, 2, 3, 4]);
        buf.zero_padding_slot();
        assert_eq!(buf.packet_at(-2), &[0, 0, 0, 0]);
    }

    #[test]
    fn shift_moves_tail_to_front() {
        let mut buf = PortBuffer::new(2, 4, 0);
        for i in 0..4 {
            buf.packet_at_mut(i as isize).copy_from_slice(&[i as u8; 2]);
        }
        // Shift last 2 packets to the front, no padding.
        let new_offset = buf.shift_remainder(2, 0, 0);
        assert_eq!(buf.packet_at(0), &[2u8, 2]);
        assert_eq!(buf.packet_at(1), &[3u8, 3]);
        assert_eq!(new_offset, 4);
    }

    #[test]
    fn shift_with_padding_lands_in_guard_region() {
        let mut buf = PortBuffer::new(2, 4, 0);
        for i in 0..4 {
            buf.packet_at_mut(i as isize).copy_from_slice(&[i as u8; 2]);
        }
        buf.shift_remainder(1, 1, 0);
        // padding=1 keeps one extra packet ahead in the guard slot -1.
        assert_eq!(buf.packet_at(-1), &[2u8, 2]);
        assert_eq!(buf.packet_at(0), &[3u8, 3]);
    }
}
