//! UDP wire protocol for the bridge.
//!
//! Every datagram is a fixed 38-byte big-endian header followed by up to
//! `mtu - 38` bytes of payload. One logical frame (a video access unit or
//! an audio buffer) is split across `fragment_count` datagrams that share
//! a sequence number.
//!
//! Header layout:
//!
//! ```text
//! Offset | Field           | Type  | Description
//! -------|-----------------|-------|---------------------------------
//! 0-3    | magic           | u32   | 0x4E444942 ("NDIB")
//! 4      | version         | u8    | Protocol version (2)
//! 5      | media_type      | u8    | 0 = video, 1 = audio
//! 6      | source_id       | u8    | Multi-source slot (currently 0)
//! 7      | flags           | u8    | Bit 0 = keyframe (video)
//! 8-11   | sequence_number | u32   | Per-frame sequence
//! 12-19  | timestamp       | u64   | PTS in 10 MHz ticks
//! 20-23  | total_size      | u32   | Full frame payload size
//! 24-25  | fragment_index  | u16   | 0-based fragment position
//! 26-27  | fragment_count  | u16   | Fragments in this frame
//! 28-29  | payload_size    | u16   | Payload bytes in this packet
//! 30-33  | sample_rate     | u32   | Audio sample rate
//! 34     | channels        | u8    | Audio channel count
//! 35-37  | reserved        | [u8]  | Zeroed
//! ```

use thiserror::Error;

pub mod reassembly;

/// "NDIB" in big-endian.
pub const PROTOCOL_MAGIC: u32 = 0x4E44_4942;
/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 2;
/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 38;
/// Default datagram size (header + payload). Use 1200 on WireGuard or
/// Tailscale tunnels, which typically carry an inner MTU around 1280.
pub const DEFAULT_MTU: usize = 1400;
/// Protocol timestamps tick at 10 MHz (100 ns resolution, same as NDI).
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Keyframe flag bit (video only).
pub const FLAG_KEYFRAME: u8 = 0x01;

/// Media stream carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video = 0,
    Audio = 1,
}

impl MediaType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MediaType::Video),
            1 => Some(MediaType::Audio),
            _ => None,
        }
    }
}

/// Errors produced while parsing or validating a packet header.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet shorter than header ({0} bytes)")]
    Truncated(usize),

    #[error("bad magic 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown media type {0}")]
    UnknownMediaType(u8),

    #[error("fragment index {index} out of range (count {count})")]
    InvalidFragment { index: u16, count: u16 },

    #[error("payload size {size} exceeds mtu budget {max}")]
    OversizedPayload { size: u16, max: usize },
}

/// Fixed 38-byte packet header. All multi-byte fields travel big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u8,
    pub media_type: MediaType,
    pub source_id: u8,
    pub flags: u8,
    pub sequence_number: u32,
    pub timestamp: u64,
    pub total_size: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_size: u16,
    pub sample_rate: u32,
    pub channels: u8,
}

impl PacketHeader {
    /// Header for one video fragment.
    pub fn video(
        sequence_number: u32,
        timestamp: u64,
        total_size: u32,
        fragment_index: u16,
        fragment_count: u16,
        payload_size: u16,
        is_keyframe: bool,
    ) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            media_type: MediaType::Video,
            source_id: 0,
            flags: if is_keyframe { FLAG_KEYFRAME } else { 0 },
            sequence_number,
            timestamp,
            total_size,
            fragment_index,
            fragment_count,
            payload_size,
            sample_rate: 0,
            channels: 0,
        }
    }

    /// Header for one audio fragment.
    #[allow(clippy::too_many_arguments)]
    pub fn audio(
        sequence_number: u32,
        timestamp: u64,
        total_size: u32,
        fragment_index: u16,
        fragment_count: u16,
        payload_size: u16,
        sample_rate: u32,
        channels: u8,
    ) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            media_type: MediaType::Audio,
            source_id: 0,
            flags: 0,
            sequence_number,
            timestamp,
            total_size,
            fragment_index,
            fragment_count,
            payload_size,
            sample_rate,
            channels,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        (self.flags & FLAG_KEYFRAME) != 0
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    /// Serialize into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Panics if `buf` is shorter than the header.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.media_type as u8;
        buf[6] = self.source_id;
        buf[7] = self.flags;
        buf[8..12].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[12..20].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[20..24].copy_from_slice(&self.total_size.to_be_bytes());
        buf[24..26].copy_from_slice(&self.fragment_index.to_be_bytes());
        buf[26..28].copy_from_slice(&self.fragment_count.to_be_bytes());
        buf[28..30].copy_from_slice(&self.payload_size.to_be_bytes());
        buf[30..34].copy_from_slice(&self.sample_rate.to_be_bytes());
        buf[34] = self.channels;
        buf[35..38].fill(0);
    }

    /// Serialize into a fresh fixed-size buffer.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.write_to(&mut buf);
        buf
    }

    /// Parse a header from the front of a datagram.
    ///
    /// Fails without side effects on short input, bad magic, or an
    /// unsupported version; callers count and drop such packets.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated(data.len()));
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = data[4];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let media_type =
            MediaType::from_u8(data[5]).ok_or(ProtocolError::UnknownMediaType(data[5]))?;

        Ok(Self {
            magic,
            version,
            media_type,
            source_id: data[6],
            flags: data[7],
            sequence_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            timestamp: u64::from_be_bytes([
                data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
            ]),
            total_size: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
            fragment_index: u16::from_be_bytes([data[24], data[25]]),
            fragment_count: u16::from_be_bytes([data[26], data[27]]),
            payload_size: u16::from_be_bytes([data[28], data[29]]),
            sample_rate: u32::from_be_bytes([data[30], data[31], data[32], data[33]]),
            channels: data[34],
        })
    }

    /// Check the fragment invariants against a datagram size budget.
    pub fn validate(&self, mtu: usize) -> Result<(), ProtocolError> {
        if self.fragment_index >= self.fragment_count {
            return Err(ProtocolError::InvalidFragment {
                index: self.fragment_index,
                count: self.fragment_count,
            });
        }
        let max = max_payload(mtu);
        if self.payload_size as usize > max {
            return Err(ProtocolError::OversizedPayload {
                size: self.payload_size,
                max,
            });
        }
        Ok(())
    }

    /// One-line description for debug logging.
    pub fn describe(&self) -> String {
        format!(
            "seq={} type={:?}{} ts={} size={} frag={}/{} payload={}",
            self.sequence_number,
            self.media_type,
            if self.is_video() && self.is_keyframe() { " [KEY]" } else { "" },
            self.timestamp,
            self.total_size,
            self.fragment_index,
            self.fragment_count,
            self.payload_size,
        )
    }
}

/// Payload bytes available per datagram at a given MTU.
pub fn max_payload(mtu: usize) -> usize {
    mtu.saturating_sub(HEADER_SIZE)
}

/// Number of datagrams needed to carry `total_size` payload bytes.
pub fn fragment_count(total_size: u32, mtu: usize) -> u16 {
    let per_packet = max_payload(mtu) as u32;
    ((total_size + per_packet - 1) / per_packet) as u16
}

/// Nanoseconds to 10 MHz protocol ticks.
pub fn ticks_from_ns(ns: u64) -> u64 {
    ns / 100
}

/// 10 MHz protocol ticks to nanoseconds.
pub fn ns_from_ticks(ticks: u64) -> u64 {
    ticks * 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_video() {
        let header = PacketHeader::video(42, 10_000_000, 2724, 1, 2, 1362, true);
        let bytes = header.to_bytes();
        let parsed = PacketHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_keyframe());
        assert!(parsed.is_video());
    }

    #[test]
    fn test_header_roundtrip_audio() {
        let header = PacketHeader::audio(7, 123_456_789, 7680, 0, 1, 7680, 48000, 2);
        let bytes = header.to_bytes();
        let parsed = PacketHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.sample_rate, 48000);
        assert_eq!(parsed.channels, 2);
        assert!(!parsed.is_keyframe());
    }

    #[test]
    fn test_header_byte_layout() {
        let mut header = PacketHeader::video(0x01020304, 0x0102030405060708, 2724, 1, 2, 1362, true);
        header.source_id = 0x05;
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], &[0x4E, 0x44, 0x49, 0x42]); // "NDIB"
        assert_eq!(bytes[4], 2); // version
        assert_eq!(bytes[5], 0); // video
        assert_eq!(bytes[6], 0x05); // source id
        assert_eq!(bytes[7], 0x01); // keyframe flag
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[12..20], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[20..24], &[0x00, 0x00, 0x0A, 0xA4]); // 2724
        assert_eq!(&bytes[24..26], &[0x00, 0x01]);
        assert_eq!(&bytes[26..28], &[0x00, 0x02]);
        assert_eq!(&bytes[28..30], &[0x05, 0x52]); // 1362
        assert_eq!(&bytes[30..34], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(bytes[34], 0);
        assert_eq!(&bytes[35..38], &[0, 0, 0]);
    }

    #[test]
    fn test_parse_truncated() {
        let header = PacketHeader::video(1, 0, 10, 0, 1, 10, false);
        let bytes = header.to_bytes();
        assert_eq!(
            PacketHeader::parse(&bytes[..HEADER_SIZE - 1]),
            Err(ProtocolError::Truncated(HEADER_SIZE - 1))
        );
    }

    #[test]
    fn test_parse_bad_magic() {
        let mut bytes = PacketHeader::video(1, 0, 10, 0, 1, 10, false).to_bytes();
        bytes[0] = 0xFF;
        assert!(matches!(
            PacketHeader::parse(&bytes),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_parse_bad_version() {
        let mut bytes = PacketHeader::video(1, 0, 10, 0, 1, 10, false).to_bytes();
        bytes[4] = 99;
        assert_eq!(
            PacketHeader::parse(&bytes),
            Err(ProtocolError::UnsupportedVersion(99))
        );
    }

    #[test]
    fn test_validate_fragment_bounds() {
        let mut header = PacketHeader::video(1, 0, 100, 0, 1, 100, false);
        assert!(header.validate(DEFAULT_MTU).is_ok());

        header.fragment_index = 1;
        assert!(matches!(
            header.validate(DEFAULT_MTU),
            Err(ProtocolError::InvalidFragment { .. })
        ));
    }

    #[test]
    fn test_validate_payload_budget() {
        let header = PacketHeader::video(1, 0, 2000, 0, 2, 1363, false);
        assert!(matches!(
            header.validate(1400),
            Err(ProtocolError::OversizedPayload { .. })
        ));
        let header = PacketHeader::video(1, 0, 2000, 0, 2, 1362, false);
        assert!(header.validate(1400).is_ok());
    }

    #[test]
    fn test_fragment_count() {
        // 1400-byte MTU carries 1362 payload bytes per datagram.
        assert_eq!(fragment_count(100, 1400), 1);
        assert_eq!(fragment_count(1362, 1400), 1);
        assert_eq!(fragment_count(1363, 1400), 2);
        assert_eq!(fragment_count(2724, 1400), 2); // exact fit
        assert_eq!(fragment_count(0, 1400), 0);
        // Tunnel-friendly MTU.
        assert_eq!(fragment_count(1162, 1200), 1);
        assert_eq!(fragment_count(1163, 1200), 2);
    }

    #[test]
    fn test_tick_conversions() {
        assert_eq!(ticks_from_ns(1_000_000_000), TICKS_PER_SECOND);
        assert_eq!(ns_from_ticks(TICKS_PER_SECOND), 1_000_000_000);
        assert_eq!(ticks_from_ns(ns_from_ticks(12_345_678)), 12_345_678);
        assert_eq!(ticks_from_ns(99), 0);
    }
}
