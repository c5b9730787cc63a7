//! Fragment reassembly for one media stream.
//!
//! The receiver keeps one reassembler per media type. At most one frame
//! is in flight: once a fragment for a newer sequence number arrives, the
//! older frame can never complete (the sender has moved on), so it is
//! discarded and counted with its completion ratio.

use log::debug;

use super::{max_payload, MediaType, PacketHeader};

/// A fully reassembled frame, ready for decode or pass-through.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    pub media_type: MediaType,
    pub sequence_number: u32,
    pub timestamp: u64,
    pub data: Vec<u8>,
    /// Video only.
    pub is_keyframe: bool,
    /// Audio only.
    pub sample_rate: u32,
    /// Audio only.
    pub channels: u8,
}

/// Counters kept by one reassembler.
///
/// The `fragments_*_before_drop` pair yields the average completion ratio
/// of dropped frames, which separates MTU problems (ratio near zero) from
/// marginal link capacity (ratio near one).
#[derive(Debug, Default, Clone)]
pub struct ReassemblyStats {
    pub packets_received: u64,
    pub packets_duplicate: u64,
    pub packets_invalid: u64,
    pub frames_completed: u64,
    pub frames_dropped: u64,
    pub fragments_received_before_drop: u64,
    pub fragments_expected_before_drop: u64,
}

impl ReassemblyStats {
    /// Average fraction of fragments that had arrived for dropped frames.
    pub fn dropped_completion_ratio(&self) -> f64 {
        if self.fragments_expected_before_drop == 0 {
            return 0.0;
        }
        self.fragments_received_before_drop as f64 / self.fragments_expected_before_drop as f64
    }
}

/// The frame currently being assembled.
struct PendingFrame {
    media_type: MediaType,
    sequence_number: u32,
    timestamp: u64,
    fragment_count: u16,
    flags: u8,
    sample_rate: u32,
    channels: u8,
    received: Vec<bool>,
    data: Vec<u8>,
    received_count: u16,
}

/// Reassembles fragmented frames for a single media type.
pub struct FrameReassembler {
    mtu: usize,
    pending: Option<PendingFrame>,
    stats: ReassemblyStats,
}

impl FrameReassembler {
    /// `mtu` must match the sending side; fragment payload offsets are
    /// multiples of `mtu - 38`.
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            pending: None,
            stats: ReassemblyStats::default(),
        }
    }

    /// Feed one validated packet. Returns the completed frame once every
    /// fragment of the in-flight sequence has arrived.
    pub fn add_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> Option<CompletedFrame> {
        self.stats.packets_received += 1;

        // A different sequence number obsoletes whatever is in flight.
        let start_new = match &self.pending {
            Some(pf) => pf.sequence_number != header.sequence_number,
            None => true,
        };

        if start_new {
            if let Some(pf) = self.pending.take() {
                self.stats.frames_dropped += 1;
                self.stats.fragments_received_before_drop += pf.received_count as u64;
                self.stats.fragments_expected_before_drop += pf.fragment_count as u64;
                debug!(
                    "dropped frame seq={}: got {}/{} fragments ({:.0}%)",
                    pf.sequence_number,
                    pf.received_count,
                    pf.fragment_count,
                    100.0 * pf.received_count as f64 / pf.fragment_count as f64
                );
            }

            self.pending = Some(PendingFrame {
                media_type: header.media_type,
                sequence_number: header.sequence_number,
                timestamp: header.timestamp,
                fragment_count: header.fragment_count,
                flags: header.flags,
                sample_rate: header.sample_rate,
                channels: header.channels,
                received: vec![false; header.fragment_count as usize],
                data: vec![0u8; header.total_size as usize],
                received_count: 0,
            });
        }

        let pf = self.pending.as_mut()?;

        if header.fragment_index >= pf.fragment_count {
            self.stats.packets_invalid += 1;
            return None;
        }

        if pf.received[header.fragment_index as usize] {
            self.stats.packets_duplicate += 1;
            return None;
        }

        let offset = header.fragment_index as usize * max_payload(self.mtu);
        let copy_len = payload.len().min(header.payload_size as usize);
        if offset + copy_len > pf.data.len() {
            self.stats.packets_invalid += 1;
            return None;
        }
        pf.data[offset..offset + copy_len].copy_from_slice(&payload[..copy_len]);
        pf.received[header.fragment_index as usize] = true;
        pf.received_count += 1;

        if pf.received_count == pf.fragment_count {
            let pf = self.pending.take().unwrap();
            self.stats.frames_completed += 1;
            return Some(CompletedFrame {
                media_type: pf.media_type,
                sequence_number: pf.sequence_number,
                timestamp: pf.timestamp,
                data: pf.data,
                is_keyframe: (pf.flags & super::FLAG_KEYFRAME) != 0,
                sample_rate: pf.sample_rate,
                channels: pf.channels,
            });
        }

        None
    }

    /// Discard any in-flight frame and zero the counters.
    pub fn reset(&mut self) {
        self.pending = None;
        self.stats = ReassemblyStats::default();
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{fragment_count, DEFAULT_MTU};

    const MTU: usize = 1400;
    const PAYLOAD: usize = MTU - crate::protocol::HEADER_SIZE; // 1362

    /// Split a frame into (header, payload) fragments the way the sender does.
    fn fragments(
        seq: u32,
        timestamp: u64,
        data: &[u8],
        is_keyframe: bool,
    ) -> Vec<(PacketHeader, Vec<u8>)> {
        let count = fragment_count(data.len() as u32, MTU);
        (0..count)
            .map(|i| {
                let offset = i as usize * PAYLOAD;
                let len = PAYLOAD.min(data.len() - offset);
                let header = PacketHeader::video(
                    seq,
                    timestamp,
                    data.len() as u32,
                    i,
                    count,
                    len as u16,
                    is_keyframe,
                );
                (header, data[offset..offset + len].to_vec())
            })
            .collect()
    }

    #[test]
    fn test_single_fragment_frame() {
        let mut reassembler = FrameReassembler::new(DEFAULT_MTU);
        let data = vec![0xAB; 100];
        let frags = fragments(1, 10_000_000, &data, true);
        assert_eq!(frags.len(), 1);

        let frame = reassembler.add_packet(&frags[0].0, &frags[0].1).unwrap();
        assert!(frame.is_keyframe);
        assert_eq!(frame.timestamp, 10_000_000);
        assert_eq!(frame.data.len(), 100);
        assert_eq!(frame.data, data);

        let stats = reassembler.stats();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.frames_completed, 1);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[test]
    fn test_exact_fit_out_of_order() {
        // 2724 bytes over a 1400-byte MTU: two full 1362-byte payloads.
        let mut reassembler = FrameReassembler::new(MTU);
        let data: Vec<u8> = (0..2724u32).map(|i| (i % 251) as u8).collect();
        let frags = fragments(9, 0, &data, false);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].1.len(), 1362);
        assert_eq!(frags[1].1.len(), 1362);

        assert!(reassembler.add_packet(&frags[1].0, &frags[1].1).is_none());
        let frame = reassembler.add_packet(&frags[0].0, &frags[0].1).unwrap();
        assert_eq!(frame.data, data);
    }

    #[test]
    fn test_any_permutation_completes() {
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 241) as u8).collect();
        let frags = fragments(3, 77, &data, false);
        assert_eq!(frags.len(), 3);

        for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1], [0, 2, 1], [1, 0, 2]] {
            let mut reassembler = FrameReassembler::new(MTU);
            let mut completed = None;
            for &i in &order {
                if let Some(frame) = reassembler.add_packet(&frags[i].0, &frags[i].1) {
                    completed = Some(frame);
                }
            }
            let frame = completed.expect("frame should complete");
            assert_eq!(frame.data, data);
            assert_eq!(reassembler.stats().frames_completed, 1);
        }
    }

    #[test]
    fn test_lost_fragment_drops_frame() {
        let mut reassembler = FrameReassembler::new(MTU);
        let frame_a: Vec<u8> = vec![1; 3 * PAYLOAD]; // 3 fragments
        let frame_b: Vec<u8> = vec![2; PAYLOAD + 1]; // 2 fragments
        let frags_a = fragments(100, 0, &frame_a, false);
        let frags_b = fragments(101, 0, &frame_b, false);

        // Fragment 1 of A lost in the network.
        assert!(reassembler.add_packet(&frags_a[0].0, &frags_a[0].1).is_none());
        assert!(reassembler.add_packet(&frags_a[2].0, &frags_a[2].1).is_none());

        // First fragment of B flushes A as a drop.
        assert!(reassembler.add_packet(&frags_b[0].0, &frags_b[0].1).is_none());
        let stats = reassembler.stats();
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.fragments_received_before_drop, 2);
        assert_eq!(stats.fragments_expected_before_drop, 3);

        let frame = reassembler.add_packet(&frags_b[1].0, &frags_b[1].1).unwrap();
        assert_eq!(frame.data, frame_b);
        assert_eq!(reassembler.stats().frames_completed, 1);
        assert!((reassembler.stats().dropped_completion_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_fragment() {
        let mut reassembler = FrameReassembler::new(MTU);
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 199) as u8).collect();
        let frags = fragments(5, 0, &data, false);
        assert_eq!(frags.len(), 2);

        assert!(reassembler.add_packet(&frags[0].0, &frags[0].1).is_none());
        assert!(reassembler.add_packet(&frags[0].0, &frags[0].1).is_none());
        let frame = reassembler.add_packet(&frags[1].0, &frags[1].1).unwrap();

        assert_eq!(frame.data, data);
        let stats = reassembler.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_duplicate, 1);
        assert_eq!(stats.frames_completed, 1);
    }

    #[test]
    fn test_fragment_index_out_of_range() {
        let mut reassembler = FrameReassembler::new(MTU);
        let frags = fragments(1, 0, &[0u8; 100], false);

        // Forge a fragment index past the pending frame's count.
        let mut bogus = frags[0].0;
        bogus.fragment_index = 5;
        assert!(reassembler.add_packet(&frags[0].0, &frags[0].1).is_some());
        assert!(reassembler.add_packet(&bogus, &frags[0].1).is_none());
        // New pending frame was created for the same sequence, then rejected.
        assert_eq!(reassembler.stats().packets_invalid, 1);
    }

    #[test]
    fn test_fragmented_audio() {
        // Audio rarely fragments, but the reassembler must accept it.
        let mut reassembler = FrameReassembler::new(MTU);
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 127) as u8).collect();
        let count = fragment_count(data.len() as u32, MTU);
        assert_eq!(count, 3);

        let mut completed = None;
        for i in 0..count {
            let offset = i as usize * PAYLOAD;
            let len = PAYLOAD.min(data.len() - offset);
            let header = PacketHeader::audio(
                50,
                999,
                data.len() as u32,
                i,
                count,
                len as u16,
                48000,
                2,
            );
            completed = reassembler.add_packet(&header, &data[offset..offset + len]);
        }

        let frame = completed.expect("audio frame should complete");
        assert_eq!(frame.media_type, MediaType::Audio);
        assert_eq!(frame.sample_rate, 48000);
        assert_eq!(frame.channels, 2);
        assert_eq!(frame.data, data);
    }
}
