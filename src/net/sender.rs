//! Fragmenting UDP sender.
//!
//! Encoded frames are split into MTU-sized datagrams and pushed through a
//! connected non-blocking socket, fire-and-forget. A full kernel buffer
//! (`WouldBlock`) is a counted drop, not an error: retrying would stall
//! the encode thread and push the whole pipeline out of real time.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};

use crate::protocol::{self, MediaType, PacketHeader, DEFAULT_MTU, HEADER_SIZE};

use super::{socket, NetError, SEND_BUFFER_SIZE};

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct UdpSenderConfig {
    /// Destination host (IP or name).
    pub host: String,
    /// Destination UDP port.
    pub port: u16,
    /// Datagram size budget, header included.
    pub mtu: usize,
    /// Sleep between successive fragments of one frame, in microseconds.
    /// Zero disables pacing. Links with shallow per-flow buffers (VPN
    /// tunnels) benefit from a small non-zero value.
    pub pacing_delay_us: u64,
}

impl Default for UdpSenderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5990,
            mtu: DEFAULT_MTU,
            pacing_delay_us: 0,
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    frames_sent: AtomicU64,
    packets_dropped_eagain: AtomicU64,
    send_errors: AtomicU64,
}

/// Snapshot of sender counters.
#[derive(Debug, Default, Clone)]
pub struct UdpSenderStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub frames_sent: u64,
    /// Fragments discarded because the kernel send buffer was full.
    pub packets_dropped_eagain: u64,
    pub send_errors: u64,
}

/// Shared handle for reading sender counters from another thread.
#[derive(Clone)]
pub struct UdpSenderStatsHandle {
    stats: Arc<AtomicStats>,
}

impl UdpSenderStatsHandle {
    pub fn snapshot(&self) -> UdpSenderStats {
        UdpSenderStats {
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            packets_dropped_eagain: self.stats.packets_dropped_eagain.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }
}

type ErrorCallback = Box<dyn Fn(&str) + Send>;

/// Fragmenting fire-and-forget UDP sender.
pub struct UdpSender {
    config: UdpSenderConfig,
    socket: Option<UdpSocket>,
    sequence_number: u32,
    packet_buf: Vec<u8>,
    stats: Arc<AtomicStats>,
    on_error: Option<ErrorCallback>,
}

impl UdpSender {
    pub fn new(config: UdpSenderConfig) -> Self {
        let mtu = config.mtu;
        Self {
            config,
            socket: None,
            sequence_number: 0,
            packet_buf: vec![0u8; mtu],
            stats: Arc::new(AtomicStats::default()),
            on_error: None,
        }
    }

    /// Install the hard-error callback. Transient drops never fire it.
    pub fn set_on_error(&mut self, callback: ErrorCallback) {
        self.on_error = Some(callback);
    }

    /// Resolve the configured target and connect the socket.
    pub fn connect(&mut self) -> Result<(), NetError> {
        if self.socket.is_some() {
            self.disconnect();
        }
        let socket = socket::connect_udp(&self.config.host, self.config.port, SEND_BUFFER_SIZE)?;
        info!(
            "connected to {}:{} (non-blocking, pacing {}us)",
            self.config.host, self.config.port, self.config.pacing_delay_us
        );
        self.socket = Some(socket);
        Ok(())
    }

    /// Close the socket. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            let stats = self.stats();
            info!(
                "disconnected: {} bytes, {} packets, {} frames sent",
                stats.bytes_sent, stats.packets_sent, stats.frames_sent
            );
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Fragment and send one encoded video access unit.
    pub fn send_video(
        &mut self,
        data: &[u8],
        is_keyframe: bool,
        timestamp: u64,
    ) -> Result<(), NetError> {
        self.send_frame(MediaType::Video, data, timestamp, is_keyframe, 0, 0)
    }

    /// Fragment and send one audio buffer (planar f32 sample bytes).
    pub fn send_audio(
        &mut self,
        data: &[u8],
        timestamp: u64,
        sample_rate: u32,
        channels: u8,
    ) -> Result<(), NetError> {
        self.send_frame(MediaType::Audio, data, timestamp, false, sample_rate, channels)
    }

    fn send_frame(
        &mut self,
        media_type: MediaType,
        data: &[u8],
        timestamp: u64,
        is_keyframe: bool,
        sample_rate: u32,
        channels: u8,
    ) -> Result<(), NetError> {
        if self.socket.is_none() {
            return Err(NetError::NotConnected);
        }

        let max_payload = protocol::max_payload(self.config.mtu);
        let count = protocol::fragment_count(data.len() as u32, self.config.mtu);
        self.sequence_number = self.sequence_number.wrapping_add(1);
        let seq = self.sequence_number;

        for i in 0..count {
            let offset = i as usize * max_payload;
            let payload_len = max_payload.min(data.len() - offset);

            let header = match media_type {
                MediaType::Video => PacketHeader::video(
                    seq,
                    timestamp,
                    data.len() as u32,
                    i,
                    count,
                    payload_len as u16,
                    is_keyframe,
                ),
                MediaType::Audio => PacketHeader::audio(
                    seq,
                    timestamp,
                    data.len() as u32,
                    i,
                    count,
                    payload_len as u16,
                    sample_rate,
                    channels,
                ),
            };

            header.write_to(&mut self.packet_buf);
            self.packet_buf[HEADER_SIZE..HEADER_SIZE + payload_len]
                .copy_from_slice(&data[offset..offset + payload_len]);

            self.send_packet(HEADER_SIZE + payload_len)?;

            if self.config.pacing_delay_us > 0 && i + 1 < count {
                thread::sleep(Duration::from_micros(self.config.pacing_delay_us));
            }
        }

        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_packet(&mut self, len: usize) -> Result<(), NetError> {
        let socket = self.socket.as_ref().ok_or(NetError::NotConnected)?;
        loop {
            match socket.send(&self.packet_buf[..len]) {
                Ok(sent) => {
                    self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                    self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // Kernel buffer full: the fragment is gone, move on.
                    self.stats
                        .packets_dropped_eagain
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    error!("send error: {}", e);
                    if let Some(cb) = &self.on_error {
                        cb(&format!("send error: {}", e));
                    }
                    // UDP is stateless; the next datagram may go through.
                    return Ok(());
                }
            }
        }
    }

    pub fn stats(&self) -> UdpSenderStats {
        self.stats_handle().snapshot()
    }

    pub fn stats_handle(&self) -> UdpSenderStatsHandle {
        UdpSenderStatsHandle {
            stats: self.stats.clone(),
        }
    }
}

impl Drop for UdpSender {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Duration;

    fn loopback_pair(mtu: usize) -> (StdUdpSocket, UdpSender) {
        let receiver = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut sender = UdpSender::new(UdpSenderConfig {
            host: "127.0.0.1".to_string(),
            port,
            mtu,
            pacing_delay_us: 0,
        });
        sender.connect().unwrap();
        (receiver, sender)
    }

    fn recv_datagram(socket: &StdUdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        buf.truncate(len);
        buf
    }

    #[test]
    fn test_small_frame_single_datagram() {
        let (receiver, mut sender) = loopback_pair(1400);
        let data = vec![0x5A; 100];
        sender.send_video(&data, true, 10_000_000).unwrap();

        let datagram = recv_datagram(&receiver);
        assert_eq!(datagram.len(), HEADER_SIZE + 100); // 138 bytes

        let header = PacketHeader::parse(&datagram).unwrap();
        assert_eq!(header.media_type, MediaType::Video);
        assert!(header.is_keyframe());
        assert_eq!(header.timestamp, 10_000_000);
        assert_eq!(header.total_size, 100);
        assert_eq!(header.fragment_index, 0);
        assert_eq!(header.fragment_count, 1);
        assert_eq!(header.payload_size, 100);
        assert_eq!(&datagram[HEADER_SIZE..], &data[..]);

        let stats = sender.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_sent, (HEADER_SIZE + 100) as u64);
    }

    #[test]
    fn test_fragmentation_covers_frame_exactly() {
        let (receiver, mut sender) = loopback_pair(1400);
        // 2724 bytes: exactly two 1362-byte payloads at a 1400 MTU.
        let data: Vec<u8> = (0..2724u32).map(|i| (i % 253) as u8).collect();
        sender.send_video(&data, false, 0).unwrap();

        let mut payloads = vec![Vec::new(); 2];
        for _ in 0..2 {
            let datagram = recv_datagram(&receiver);
            assert_eq!(datagram.len(), 1400);
            let header = PacketHeader::parse(&datagram).unwrap();
            assert!(header.validate(1400).is_ok());
            assert_eq!(header.fragment_count, 2);
            assert_eq!(header.payload_size, 1362);
            payloads[header.fragment_index as usize] = datagram[HEADER_SIZE..].to_vec();
        }

        let reconstructed: Vec<u8> = payloads.concat();
        assert_eq!(reconstructed, data);
    }

    #[test]
    fn test_fragment_count_matches_datagrams() {
        let (receiver, mut sender) = loopback_pair(1200);
        let data = vec![7u8; 5000];
        let expected = protocol::fragment_count(5000, 1200); // ceil(5000/1162) = 5
        sender.send_video(&data, false, 0).unwrap();

        let mut total = 0usize;
        for i in 0..expected {
            let datagram = recv_datagram(&receiver);
            let header = PacketHeader::parse(&datagram).unwrap();
            assert_eq!(header.fragment_index, i);
            assert_eq!(header.fragment_count, expected);
            total += header.payload_size as usize;
        }
        assert_eq!(total, 5000);
        assert_eq!(sender.stats().packets_sent, expected as u64);
    }

    #[test]
    fn test_sequence_numbers_increment_across_media() {
        let (receiver, mut sender) = loopback_pair(1400);
        sender.send_video(&[1u8; 10], false, 0).unwrap();
        sender.send_audio(&[0u8; 32], 0, 48000, 2).unwrap();

        let first = PacketHeader::parse(&recv_datagram(&receiver)).unwrap();
        let second = PacketHeader::parse(&recv_datagram(&receiver)).unwrap();
        assert_eq!(second.sequence_number, first.sequence_number + 1);
        assert_eq!(second.media_type, MediaType::Audio);
        assert_eq!(second.sample_rate, 48000);
        assert_eq!(second.channels, 2);
    }

    #[test]
    fn test_send_without_connect_fails() {
        let mut sender = UdpSender::new(UdpSenderConfig::default());
        assert!(matches!(
            sender.send_video(&[0u8; 4], false, 0),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn test_audio_header_parses_clean() {
        // Belt and braces: an audio datagram straight off the socket
        // passes the same validation the receiver applies.
        let (receiver, mut sender) = loopback_pair(1400);
        let samples = vec![0u8; 1920 * 4 * 2];
        sender.send_audio(&samples, 5_000_000, 48000, 2).unwrap();

        let datagram = recv_datagram(&receiver);
        let header = PacketHeader::parse(&datagram).unwrap();
        assert!(header.validate(1400).is_ok());
        assert_eq!(header.media_type, MediaType::Audio);
    }
}
