//! RX reassembly: reconstitutes a logical message (`PacketHeader` + payload)
//! from a sequence of fragments received on one connection.

use mesh_core::SplitHeader;
use tracing::warn;

/// Outcome of feeding one fragment to a [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// A single-fragment message passed through without buffering.
    Complete(Vec<u8>),
    /// More fragments are needed before the message is complete.
    Pending,
    /// `split_counter` did not match the expected next value; the
    /// in-progress buffer was discarded. The caller should raise
    /// `SPLIT_PACKET_MISSING` telemetry.
    MissingFragment,
}

/// Per-connection fixed-size reassembly buffer (sized to
/// `max_mesh_packet_size`, independent of the connection's MTU).
pub struct Reassembler {
    capacity: usize,
    buffer: Vec<u8>,
    expected_counter: u8,
    in_progress: bool,
}

impl Reassembler {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffer: Vec::with_capacity(capacity),
            expected_counter: 0,
            in_progress: false,
        }
    }

    /// Feeds one received fragment through reassembly.
    ///
    /// A fragment whose leading byte does not look like a split header marker
    /// is a bare, single-fragment message and passes straight through. A
    /// fragment carrying a split header with `split_counter = 0` always
    /// resets any in-progress reassembly (even mid-message); any other
    /// counter must equal the expected next value or the in-progress message
    /// is dropped.
    pub fn on_fragment(&mut self, bytes: &[u8]) -> ReassemblyOutcome {
        let Some(&first) = bytes.first() else {
            return ReassemblyOutcome::MissingFragment;
        };

        if !SplitHeader::looks_like_fragment_marker(first) {
            self.in_progress = false;
            self.buffer.clear();
            return ReassemblyOutcome::Complete(bytes.to_vec());
        }

        let header = SplitHeader::decode(first);
        let body = &bytes[1..];

        if header.split_counter == 0 {
            self.buffer.clear();
            self.in_progress = true;
            self.expected_counter = 0;
        } else if !self.in_progress || header.split_counter != self.expected_counter {
            self.in_progress = false;
            self.buffer.clear();
            warn!(
                expected = self.expected_counter,
                got = header.split_counter,
                "packet queue: split counter gap, discarding in-progress reassembly"
            );
            return ReassemblyOutcome::MissingFragment;
        }

        if self.buffer.len() + body.len() > self.capacity {
            self.in_progress = false;
            self.buffer.clear();
            warn!("packet queue: reassembled message would exceed max_mesh_packet_size");
            return ReassemblyOutcome::MissingFragment;
        }

        self.buffer.extend_from_slice(body);
        self.expected_counter = self.expected_counter.wrapping_add(1);

        if header.split_message_type == mesh_core::MessageType::SPLIT_WRITE_CMD_END {
            self.in_progress = false;
            let complete = std::mem::take(&mut self.buffer);
            ReassemblyOutcome::Complete(complete)
        } else {
            ReassemblyOutcome::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_queue::fragment_message;

    #[test]
    fn single_fragment_message_passes_through() {
        let mut r = Reassembler::new(200);
        // A bare PacketHeader (message_type=42) fits well under the mtu, so
        // byte 0 is 42 -- top 3 bits (42>>5=1) don't collide with the
        // SPLIT_WRITE_CMD/END sentinels (5, 6).
        let logical = vec![42u8, 1, 0, 2, 0, b'h', b'i'];
        assert_eq!(
            r.on_fragment(&logical),
            ReassemblyOutcome::Complete(logical)
        );
    }

    #[test]
    fn multi_fragment_message_round_trips() {
        let logical: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let fragments = fragment_message(&logical, 23);
        assert!(fragments.len() > 1);

        let mut r = Reassembler::new(200);
        let mut result = None;
        for fragment in &fragments {
            match r.on_fragment(fragment) {
                ReassemblyOutcome::Pending => {}
                ReassemblyOutcome::Complete(bytes) => result = Some(bytes),
                ReassemblyOutcome::MissingFragment => panic!("unexpected gap"),
            }
        }
        assert_eq!(result, Some(logical));
    }

    #[test]
    fn mid_sequence_drop_raises_missing_then_recovers_on_next_message() {
        let logical_a: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let fragments_a = fragment_message(&logical_a, 23);
        let logical_b: Vec<u8> = (0..150).map(|i| (i * 2) as u8).collect();
        let fragments_b = fragment_message(&logical_b, 23);

        let mut r = Reassembler::new(200);
        // Feed fragments 0..3 of message A, then skip straight to the last
        // fragment to simulate fragment #4 being dropped.
        for fragment in &fragments_a[..3] {
            assert_eq!(r.on_fragment(fragment), ReassemblyOutcome::Pending);
        }
        let last = fragments_a.last().unwrap();
        assert_eq!(r.on_fragment(last), ReassemblyOutcome::MissingFragment);

        // Next independent message, starting at split_counter = 0, must
        // still reassemble correctly.
        let mut result = None;
        for fragment in &fragments_b {
            match r.on_fragment(fragment) {
                ReassemblyOutcome::Pending => {}
                ReassemblyOutcome::Complete(bytes) => result = Some(bytes),
                ReassemblyOutcome::MissingFragment => panic!("unexpected gap in message b"),
            }
        }
        assert_eq!(result, Some(logical_b));
    }

    #[test]
    fn counter_zero_resets_mid_message() {
        let logical: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let fragments = fragment_message(&logical, 23);

        let mut r = Reassembler::new(200);
        assert_eq!(r.on_fragment(&fragments[0]), ReassemblyOutcome::Pending);
        assert_eq!(r.on_fragment(&fragments[1]), ReassemblyOutcome::Pending);
        // A fresh split_counter=0 fragment arrives (e.g. sender restarted
        // the message); reassembly must restart cleanly rather than error.
        let mut result = None;
        for fragment in &fragments {
            match r.on_fragment(fragment) {
                ReassemblyOutcome::Pending => {}
                ReassemblyOutcome::Complete(bytes) => result = Some(bytes),
                ReassemblyOutcome::MissingFragment => panic!("unexpected gap"),
            }
        }
        assert_eq!(result, Some(logical));
    }
}
