//! Join pipeline: UDP receive → decode → NDI publish.
//!
//! The receive thread reassembles frames and pushes video into a
//! bounded decode queue (about three seconds of video, drop-oldest). A
//! single decode thread feeds the H.264 decoder; decoded frames either
//! go straight to the NDI output (real-time mode) or into the playout
//! buffer for a fixed extra delay (buffered mode). Audio is raw float
//! pass-through from the wire, observing the same mode.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::clock::wall_clock_us;
use crate::codec::decoder::DecoderStatsHandle;
use crate::codec::{DecoderConfig, PixelFormat, VideoDecoder};
use crate::ndi::NdiOutput;
use crate::net::{ReceiverCallbacks, UdpReceiver, UdpReceiverConfig, UdpReceiverStats};
use crate::playout::{PlayoutBuffer, PlayoutClock};
use crate::protocol::reassembly::CompletedFrame;
use crate::queue::FrameQueue;
use crate::BridgeError;

/// Decode queue capacity: 3 seconds of 30 fps video.
const DECODE_QUEUE_CAPACITY: usize = 90;
/// Playout drain granularity.
const PLAYOUT_TICK: Duration = Duration::from_micros(500);

/// Join mode configuration.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    pub listen_port: u16,
    /// Name of the NDI source this endpoint publishes.
    pub output_name: String,
    pub mtu: usize,
    /// Extra playout delay in milliseconds; 0 = real-time forwarding.
    pub buffer_ms: u32,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            listen_port: 5990,
            output_name: "NDI Bridge".to_string(),
            mtu: crate::protocol::DEFAULT_MTU,
            buffer_ms: 0,
        }
    }
}

/// Aggregated join-side counters.
#[derive(Debug, Default, Clone)]
pub struct JoinStats {
    pub network: UdpReceiverStats,
    pub video_frames_decoded: u64,
    pub keyframes_decoded: u64,
    pub decode_errors: u64,
    pub avg_decode_latency_us: u64,
    pub max_decode_latency_us: u64,
    pub video_frames_output: u64,
    pub audio_frames_output: u64,
    pub decode_queue_dropped: u64,
}

/// A decoded frame waiting in the playout buffer.
struct BufferedVideo {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    timestamp: u64,
}

/// An audio buffer waiting in the playout buffer.
struct BufferedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u8,
    samples_per_channel: u32,
    timestamp: u64,
}

struct PlayoutShared {
    clock: Mutex<PlayoutClock>,
    video: Mutex<PlayoutBuffer<BufferedVideo>>,
    audio: Mutex<PlayoutBuffer<BufferedAudio>>,
}

/// Orchestrates receive, decode and publish.
pub struct JoinPipeline {
    config: JoinConfig,
    receiver: Option<UdpReceiver>,
    decode_thread: Option<JoinHandle<()>>,
    playout_thread: Option<JoinHandle<()>>,
    decode_queue: Option<FrameQueue<CompletedFrame>>,
    output: Option<Arc<NdiOutput>>,
    playout: Option<Arc<PlayoutShared>>,
    stopped: Arc<AtomicBool>,
    playout_running: Arc<AtomicBool>,
    decoder_stats: Option<DecoderStatsHandle>,
    audio_frames_output: Arc<AtomicU64>,
}

impl JoinPipeline {
    pub fn new(config: JoinConfig) -> Self {
        Self {
            config,
            receiver: None,
            decode_thread: None,
            playout_thread: None,
            decode_queue: None,
            output: None,
            playout: None,
            stopped: Arc::new(AtomicBool::new(false)),
            playout_running: Arc::new(AtomicBool::new(false)),
            decoder_stats: None,
            audio_frames_output: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bring up decoder, NDI output, playout and the UDP listener.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        info!(
            "starting join mode: port {}, output '{}', buffer {} ms",
            self.config.listen_port, self.config.output_name, self.config.buffer_ms
        );

        // Decoder first: a broken codec install should fail startup,
        // not surface as a silent black output.
        let mut decoder = VideoDecoder::new()?;
        decoder.configure(DecoderConfig::default())?;
        self.decoder_stats = Some(decoder.stats_handle());

        let output = Arc::new(NdiOutput::new(&self.config.output_name)?);
        self.output = Some(output.clone());

        let buffered = self.config.buffer_ms > 0;
        let playout = Arc::new(PlayoutShared {
            clock: Mutex::new(PlayoutClock::new(self.config.buffer_ms)),
            video: Mutex::new(PlayoutBuffer::new()),
            audio: Mutex::new(PlayoutBuffer::new()),
        });
        self.playout = Some(playout.clone());

        // Decoded frames fan out to NDI directly or into the buffer.
        {
            let output = output.clone();
            let playout = playout.clone();
            let mut rate_tracker = FrameRateTracker::new();
            decoder.set_on_decoded_frame(Box::new(move |frame| {
                let Some(format) = frame.format else { return };
                if let Some((n, d)) = rate_tracker.update(frame.timestamp) {
                    output.set_frame_rate(n, d);
                }
                if buffered {
                    let play_time = playout
                        .clock
                        .lock()
                        .play_time_us(frame.timestamp, wall_clock_us());
                    playout.video.lock().push(
                        BufferedVideo {
                            data: frame.data.clone(),
                            width: frame.width,
                            height: frame.height,
                            stride: frame.stride,
                            format,
                            timestamp: frame.timestamp,
                        },
                        play_time,
                    );
                } else {
                    output.send_video(
                        &frame.data,
                        frame.width,
                        frame.height,
                        frame.stride,
                        format,
                        frame.timestamp,
                    );
                }
            }));
        }

        let decode_queue: FrameQueue<CompletedFrame> = FrameQueue::new(DECODE_QUEUE_CAPACITY);
        self.decode_queue = Some(decode_queue.clone());

        let decode_thread = {
            let queue = decode_queue.clone();
            thread::Builder::new()
                .name("decode".to_string())
                .spawn(move || {
                    while let Some(frame) = queue.pop() {
                        if let Err(e) = decoder.decode(&frame.data, frame.timestamp) {
                            debug!("decode error: {}", e);
                        }
                    }
                    decoder.flush();
                })
                .expect("spawn decode thread")
        };
        self.decode_thread = Some(decode_thread);

        // Playout thread only exists in buffered mode.
        if buffered {
            self.playout_running.store(true, Ordering::SeqCst);
            let running = self.playout_running.clone();
            let playout = playout.clone();
            let output = output.clone();
            let audio_out = self.audio_frames_output.clone();

            self.playout_thread = Some(
                thread::Builder::new()
                    .name("playout".to_string())
                    .spawn(move || {
                        while running.load(Ordering::SeqCst) {
                            let now = wall_clock_us();
                            for frame in playout.video.lock().drain_due(now) {
                                output.send_video(
                                    &frame.data,
                                    frame.width,
                                    frame.height,
                                    frame.stride,
                                    frame.format,
                                    frame.timestamp,
                                );
                            }
                            for frame in playout.audio.lock().drain_due(now) {
                                output.send_audio(
                                    &frame.samples,
                                    frame.sample_rate,
                                    frame.channels,
                                    frame.samples_per_channel,
                                    frame.timestamp,
                                );
                                audio_out.fetch_add(1, Ordering::Relaxed);
                            }
                            thread::sleep(PLAYOUT_TICK);
                        }
                    })
                    .expect("spawn playout thread"),
            );
            info!("playout buffer enabled: {} ms delay", self.config.buffer_ms);
        }

        // The network listener comes up last, once every consumer
        // downstream of it is ready.
        let mut receiver = UdpReceiver::new(UdpReceiverConfig {
            port: self.config.listen_port,
            mtu: self.config.mtu,
            ..UdpReceiverConfig::default()
        });

        let callbacks = {
            let queue = decode_queue.clone();
            let output = output.clone();
            let playout = playout.clone();
            let audio_out = self.audio_frames_output.clone();
            ReceiverCallbacks {
                on_video_frame: Some(Box::new(move |frame| {
                    if queue.push(frame) {
                        debug!("decode queue full, dropped oldest frame");
                    }
                })),
                on_audio_frame: Some(Box::new(move |frame| {
                    let Some(audio) = wire_audio(&frame) else { return };
                    if buffered {
                        let play_time = playout
                            .clock
                            .lock()
                            .play_time_us(frame.timestamp, wall_clock_us());
                        playout.audio.lock().push(audio, play_time);
                    } else {
                        output.send_audio(
                            &audio.samples,
                            audio.sample_rate,
                            audio.channels,
                            audio.samples_per_channel,
                            audio.timestamp,
                        );
                        audio_out.fetch_add(1, Ordering::Relaxed);
                    }
                })),
                on_error: Some(Box::new(|message| {
                    error!("network: {}", message);
                })),
            }
        };
        receiver.start(callbacks)?;
        self.receiver = Some(receiver);

        info!(
            "join mode started: waiting for stream on port {}",
            self.config.listen_port
        );
        Ok(())
    }

    /// Block until `running` clears, logging stats periodically.
    pub fn run(&mut self, running: &AtomicBool) {
        let mut ticks = 0u32;
        while running.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            ticks += 1;
            if ticks % 50 == 0 {
                let stats = self.stats();
                debug!(
                    "join: pkts={} frames(v={} a={}) dropped={} decoded={} out(v={} a={}) latency(avg={}us max={}us)",
                    stats.network.packets_received,
                    stats.network.video_frames_received,
                    stats.network.audio_frames_received,
                    stats.network.frames_dropped,
                    stats.video_frames_decoded,
                    stats.video_frames_output,
                    stats.audio_frames_output,
                    stats.avg_decode_latency_us,
                    stats.max_decode_latency_us,
                );
            }
        }
        self.stop();
    }

    /// Tear down threads and components. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping join mode");

        if let Some(mut receiver) = self.receiver.take() {
            receiver.stop();
        }
        if let Some(queue) = &self.decode_queue {
            queue.stop();
        }
        if let Some(thread) = self.decode_thread.take() {
            let _ = thread.join();
        }
        self.playout_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.playout_thread.take() {
            let _ = thread.join();
        }
        // Dropping the output deregisters the NDI source.
        self.output = None;

        let stats = self.stats();
        info!(
            "join mode stopped: {} decoded, {} video / {} audio frames output",
            stats.video_frames_decoded, stats.video_frames_output, stats.audio_frames_output
        );
    }

    pub fn stats(&self) -> JoinStats {
        let decoder = self
            .decoder_stats
            .as_ref()
            .map(|h| h.snapshot())
            .unwrap_or_default();
        JoinStats {
            network: self
                .receiver
                .as_ref()
                .map(|r| r.stats())
                .unwrap_or_default(),
            video_frames_decoded: decoder.frames_decoded,
            keyframes_decoded: decoder.keyframes_decoded,
            decode_errors: decoder.decode_errors,
            avg_decode_latency_us: decoder.avg_decode_latency_us,
            max_decode_latency_us: decoder.max_decode_latency_us,
            video_frames_output: self
                .output
                .as_ref()
                .map(|o| o.video_frames_sent())
                .unwrap_or(0),
            audio_frames_output: self.audio_frames_output.load(Ordering::Relaxed),
            decode_queue_dropped: self
                .decode_queue
                .as_ref()
                .map(|q| q.dropped())
                .unwrap_or(0),
        }
    }
}

impl Drop for JoinPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reinterpret wire audio (raw f32 sample bytes, planar) for the sink.
fn wire_audio(frame: &CompletedFrame) -> Option<BufferedAudio> {
    if frame.channels == 0 || frame.data.len() % 4 != 0 {
        return None;
    }
    let samples: Vec<f32> = frame
        .data
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let samples_per_channel = (samples.len() / frame.channels as usize) as u32;
    if samples_per_channel == 0 {
        return None;
    }
    Some(BufferedAudio {
        samples,
        sample_rate: frame.sample_rate,
        channels: frame.channels,
        samples_per_channel,
        timestamp: frame.timestamp,
    })
}

/// Infers the source frame rate from decoded-frame timestamp spacing.
/// The wire does not carry a rate; steady deltas reveal it.
struct FrameRateTracker {
    last_timestamp: Option<u64>,
    stable_delta: u64,
    stable_count: u32,
}

impl FrameRateTracker {
    fn new() -> Self {
        Self {
            last_timestamp: None,
            stable_delta: 0,
            stable_count: 0,
        }
    }

    /// Feed a timestamp; returns a rate fraction once the spacing has
    /// held steady long enough to trust.
    fn update(&mut self, timestamp: u64) -> Option<(u32, u32)> {
        let last = self.last_timestamp.replace(timestamp)?;
        let delta = timestamp.checked_sub(last)?;
        if delta == 0 || delta > crate::protocol::TICKS_PER_SECOND {
            return None;
        }

        // Within 1% of the previous delta counts as steady.
        let close = self.stable_delta > 0
            && delta.abs_diff(self.stable_delta) <= self.stable_delta / 100;
        if close {
            self.stable_count += 1;
        } else {
            self.stable_delta = delta;
            self.stable_count = 0;
        }

        if self.stable_count == 30 {
            // Report as ticks-per-second fraction, e.g. 10M/333667
            // for 29.97 fps.
            Some((crate::protocol::TICKS_PER_SECOND as u32, self.stable_delta as u32))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MediaType;

    #[test]
    fn test_stop_is_idempotent() {
        let mut pipeline = JoinPipeline::new(JoinConfig::default());
        pipeline.stop();
        pipeline.stop();
    }

    #[test]
    fn test_wire_audio_planar_layout() {
        let mut data = Vec::new();
        // Two channels, three samples each, planar on the wire.
        for value in [0.1f32, 0.2, 0.3, -0.1, -0.2, -0.3] {
            data.extend_from_slice(&value.to_ne_bytes());
        }
        let frame = CompletedFrame {
            media_type: MediaType::Audio,
            sequence_number: 1,
            timestamp: 0,
            data,
            is_keyframe: false,
            sample_rate: 48000,
            channels: 2,
        };

        let audio = wire_audio(&frame).unwrap();
        assert_eq!(audio.samples_per_channel, 3);
        assert_eq!(audio.samples, vec![0.1, 0.2, 0.3, -0.1, -0.2, -0.3]);
    }

    #[test]
    fn test_wire_audio_rejects_garbage() {
        let frame = CompletedFrame {
            media_type: MediaType::Audio,
            sequence_number: 1,
            timestamp: 0,
            data: vec![0u8; 7], // not a multiple of 4
            is_keyframe: false,
            sample_rate: 48000,
            channels: 2,
        };
        assert!(wire_audio(&frame).is_none());

        let frame = CompletedFrame {
            media_type: MediaType::Audio,
            sequence_number: 1,
            timestamp: 0,
            data: vec![0u8; 8],
            is_keyframe: false,
            sample_rate: 48000,
            channels: 0,
        };
        assert!(wire_audio(&frame).is_none());
    }

    #[test]
    fn test_frame_rate_inference() {
        let mut tracker = FrameRateTracker::new();
        let delta = 333_667u64; // 29.97 fps in 100ns ticks
        let mut reported = None;
        for i in 0..40u64 {
            if let Some(rate) = tracker.update(1_000_000 + i * delta) {
                reported = Some(rate);
            }
        }
        let (n, d) = reported.expect("steady cadence should report a rate");
        assert_eq!(n, 10_000_000);
        assert_eq!(d, delta as u32);
        // 10M / 333667 = 29.97
        assert!(((n as f64 / d as f64) - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_frame_rate_ignores_jitter() {
        let mut tracker = FrameRateTracker::new();
        // Erratic spacing never settles.
        let mut ts = 0u64;
        for i in 0..60u64 {
            ts += 100_000 + (i % 7) * 50_000;
            assert!(tracker.update(ts).is_none());
        }
    }
}
