//! UDP receive loop and packet dispatch.
//!
//! A dedicated thread owns the socket: it blocks up to 10 ms waiting for
//! a datagram, re-checks its stop flag on timeout, and routes every valid
//! packet into the per-media-type reassemblers. Completed frames are
//! handed to the installed callbacks on the same thread.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use crate::clock::wall_clock_ns;
use crate::protocol::reassembly::{CompletedFrame, FrameReassembler, ReassemblyStats};
use crate::protocol::{MediaType, PacketHeader, DEFAULT_MTU, HEADER_SIZE};

use super::{socket, NetError, RECV_BUFFER_SIZE};

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct UdpReceiverConfig {
    /// UDP port to bind on all interfaces. 0 asks the OS for a free port.
    pub port: u16,
    /// Datagram size budget; must match the sending side.
    pub mtu: usize,
    /// Kernel receive buffer request.
    pub recv_buffer_size: usize,
}

impl Default for UdpReceiverConfig {
    fn default() -> Self {
        Self {
            port: 5990,
            mtu: DEFAULT_MTU,
            recv_buffer_size: RECV_BUFFER_SIZE,
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    invalid_packets: AtomicU64,
    video_frames_received: AtomicU64,
    audio_frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    last_packet_unix_ns: AtomicU64,
    granted_recv_buffer: AtomicU64,
}

/// Snapshot of receiver counters.
#[derive(Debug, Default, Clone)]
pub struct UdpReceiverStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub invalid_packets: u64,
    pub video_frames_received: u64,
    pub audio_frames_received: u64,
    /// Frames abandoned by the reassemblers (missing fragments).
    pub frames_dropped: u64,
    /// Wall-clock arrival of the most recent packet, ns since epoch.
    pub last_packet_unix_ns: u64,
    /// Receive buffer size the kernel actually granted.
    pub granted_recv_buffer: u64,
}

/// Callbacks fired from the receive thread as frames complete.
#[derive(Default)]
pub struct ReceiverCallbacks {
    pub on_video_frame: Option<Box<dyn FnMut(CompletedFrame) + Send>>,
    pub on_audio_frame: Option<Box<dyn FnMut(CompletedFrame) + Send>>,
    pub on_error: Option<Box<dyn Fn(&str) + Send>>,
}

/// Validates headers and feeds reassemblers. Split out from the socket
/// loop so packet handling is testable with raw byte slices.
pub struct PacketProcessor {
    mtu: usize,
    video: FrameReassembler,
    audio: FrameReassembler,
    callbacks: ReceiverCallbacks,
    stats: Arc<AtomicStats>,
}

impl PacketProcessor {
    fn new(mtu: usize, callbacks: ReceiverCallbacks, stats: Arc<AtomicStats>) -> Self {
        Self {
            mtu,
            video: FrameReassembler::new(mtu),
            audio: FrameReassembler::new(mtu),
            callbacks,
            stats,
        }
    }

    /// Handle one datagram observed at `recv_ns` (ns since Unix epoch).
    pub fn process(&mut self, data: &[u8], recv_ns: u64) {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.stats
            .last_packet_unix_ns
            .store(recv_ns, Ordering::Relaxed);

        let header = match PacketHeader::parse(data) {
            Ok(h) => h,
            Err(e) => {
                debug!("invalid packet ({} bytes): {}", data.len(), e);
                self.stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Err(e) = header.validate(self.mtu) {
            debug!("invalid packet: {} - {}", e, header.describe());
            self.stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let payload = &data[HEADER_SIZE..];
        let reassembler = match header.media_type {
            MediaType::Video => &mut self.video,
            MediaType::Audio => &mut self.audio,
        };

        if let Some(frame) = reassembler.add_packet(&header, payload) {
            match frame.media_type {
                MediaType::Video => {
                    self.stats
                        .video_frames_received
                        .fetch_add(1, Ordering::Relaxed);
                    if let Some(cb) = &mut self.callbacks.on_video_frame {
                        cb(frame);
                    }
                }
                MediaType::Audio => {
                    self.stats
                        .audio_frames_received
                        .fetch_add(1, Ordering::Relaxed);
                    if let Some(cb) = &mut self.callbacks.on_audio_frame {
                        cb(frame);
                    }
                }
            }
        }

        let dropped = self.video.stats().frames_dropped + self.audio.stats().frames_dropped;
        self.stats.frames_dropped.store(dropped, Ordering::Relaxed);
    }

    pub fn video_stats(&self) -> &ReassemblyStats {
        self.video.stats()
    }

    pub fn audio_stats(&self) -> &ReassemblyStats {
        self.audio.stats()
    }
}

/// Owns the bound socket and its receive thread.
pub struct UdpReceiver {
    config: UdpReceiverConfig,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<AtomicStats>,
    local_port: u16,
}

impl UdpReceiver {
    pub fn new(config: UdpReceiverConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            stats: Arc::new(AtomicStats::default()),
            local_port: 0,
        }
    }

    /// Bind the socket and start the receive thread.
    pub fn start(&mut self, callbacks: ReceiverCallbacks) -> Result<(), NetError> {
        if self.thread.is_some() {
            return Err(NetError::AlreadyListening);
        }

        let (socket, granted) = socket::bind_udp(self.config.port, self.config.recv_buffer_size)?;
        self.local_port = socket.local_addr().map(|a| a.port()).unwrap_or(self.config.port);
        self.stats
            .granted_recv_buffer
            .store(granted as u64, Ordering::Relaxed);

        info!("listening on udp port {}", self.local_port);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let stats = self.stats.clone();
        let mtu = self.config.mtu;

        self.thread = Some(
            thread::Builder::new()
                .name("udp-recv".to_string())
                .spawn(move || {
                    receive_loop(socket, mtu, running, callbacks, stats);
                })
                .expect("spawn udp receive thread"),
        );

        Ok(())
    }

    /// Stop the receive thread and close the socket. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            let stats = self.stats();
            info!(
                "receiver stopped: {} bytes, {} video frames, {} audio frames, {} dropped",
                stats.bytes_received,
                stats.video_frames_received,
                stats.audio_frames_received,
                stats.frames_dropped
            );
        }
    }

    /// Port actually bound (differs from config when port 0 was asked).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn stats(&self) -> UdpReceiverStats {
        UdpReceiverStats {
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            invalid_packets: self.stats.invalid_packets.load(Ordering::Relaxed),
            video_frames_received: self.stats.video_frames_received.load(Ordering::Relaxed),
            audio_frames_received: self.stats.audio_frames_received.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            last_packet_unix_ns: self.stats.last_packet_unix_ns.load(Ordering::Relaxed),
            granted_recv_buffer: self.stats.granted_recv_buffer.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: UdpSocket,
    mtu: usize,
    running: Arc<AtomicBool>,
    callbacks: ReceiverCallbacks,
    stats: Arc<AtomicStats>,
) {
    let mut processor = PacketProcessor::new(mtu, callbacks, stats);
    let mut buf = vec![0u8; mtu.max(HEADER_SIZE)];

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, _sender)) => {
                if len > 0 {
                    processor.process(&buf[..len], wall_clock_ns());
                }
            }
            // Read timeout expired: loop back and re-check the stop flag.
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!("receive error: {}", e);
                    if let Some(cb) = &processor.callbacks.on_error {
                        cb(&format!("receive error: {}", e));
                    }
                    // Stateless transport: back off briefly and keep going.
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::sender::{UdpSender, UdpSenderConfig};
    use std::sync::mpsc;

    fn processor_with_channel() -> (PacketProcessor, mpsc::Receiver<CompletedFrame>) {
        let (tx, rx) = mpsc::channel();
        let tx_audio = tx.clone();
        let callbacks = ReceiverCallbacks {
            on_video_frame: Some(Box::new(move |f| tx.send(f).unwrap())),
            on_audio_frame: Some(Box::new(move |f| tx_audio.send(f).unwrap())),
            on_error: None,
        };
        let stats = Arc::new(AtomicStats::default());
        (PacketProcessor::new(1400, callbacks, stats.clone()), rx)
    }

    fn datagram(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
        let mut data = header.to_bytes().to_vec();
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_single_video_frame_dispatch() {
        let (mut processor, rx) = processor_with_channel();
        let payload = vec![0xCD; 100];
        let header = PacketHeader::video(1, 10_000_000, 100, 0, 1, 100, true);

        processor.process(&datagram(&header, &payload), 1);

        let frame = rx.try_recv().unwrap();
        assert!(frame.is_keyframe);
        assert_eq!(frame.timestamp, 10_000_000);
        assert_eq!(frame.data, payload);

        let stats = processor.video_stats();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.frames_completed, 1);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[test]
    fn test_version_mismatch_counts_invalid_only() {
        let (mut processor, rx) = processor_with_channel();
        let mut data = datagram(&PacketHeader::video(1, 0, 4, 0, 1, 4, false), &[0u8; 4]);
        data[4] = 99; // version

        processor.process(&data, 1);

        assert!(rx.try_recv().is_err());
        assert_eq!(processor.stats.invalid_packets.load(Ordering::Relaxed), 1);
        assert_eq!(processor.video_stats().packets_received, 0);
    }

    #[test]
    fn test_runt_datagram_counts_invalid() {
        let (mut processor, rx) = processor_with_channel();
        processor.process(&[0u8; 10], 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(processor.stats.invalid_packets.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_audio_frame_dispatch() {
        let (mut processor, rx) = processor_with_channel();
        let samples = vec![1u8; 256];
        let header = PacketHeader::audio(2, 555, 256, 0, 1, 256, 48000, 2);

        processor.process(&datagram(&header, &samples), 1);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.media_type, MediaType::Audio);
        assert_eq!(frame.sample_rate, 48000);
        assert_eq!(frame.channels, 2);
        assert_eq!(frame.data, samples);
    }

    #[test]
    fn test_video_and_audio_reassemble_independently() {
        let (mut processor, rx) = processor_with_channel();
        // Interleave fragments of a 2-fragment video frame with a
        // complete audio frame; both must come out intact.
        let video: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let audio = vec![9u8; 64];

        let v0 = PacketHeader::video(1, 0, 2000, 0, 2, 1362, false);
        let v1 = PacketHeader::video(1, 0, 2000, 1, 2, (2000 - 1362) as u16, false);
        let a0 = PacketHeader::audio(1, 0, 64, 0, 1, 64, 48000, 2);

        processor.process(&datagram(&v0, &video[..1362]), 1);
        processor.process(&datagram(&a0, &audio), 2);
        processor.process(&datagram(&v1, &video[1362..]), 3);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.media_type, MediaType::Audio);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.media_type, MediaType::Video);
        assert_eq!(second.data, video);
    }

    #[test]
    fn test_end_to_end_loopback() {
        let mut receiver = UdpReceiver::new(UdpReceiverConfig {
            port: 0,
            mtu: 1400,
            recv_buffer_size: 1024 * 1024,
        });

        let (tx, rx) = mpsc::channel();
        receiver
            .start(ReceiverCallbacks {
                on_video_frame: Some(Box::new(move |f| {
                    let _ = tx.send(f);
                })),
                on_audio_frame: None,
                on_error: None,
            })
            .unwrap();

        let mut sender = UdpSender::new(UdpSenderConfig {
            host: "127.0.0.1".to_string(),
            port: receiver.local_port(),
            mtu: 1400,
            pacing_delay_us: 0,
        });
        sender.connect().unwrap();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 239) as u8).collect();
        sender.send_video(&data, true, 77).unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.data, data);
        assert!(frame.is_keyframe);
        assert_eq!(frame.timestamp, 77);

        receiver.stop();
        let stats = receiver.stats();
        assert_eq!(stats.video_frames_received, 1);
        assert!(stats.granted_recv_buffer > 0);
        assert!(stats.last_packet_unix_ns > 0);
    }
}
