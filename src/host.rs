//! Host pipeline: NDI capture → encode → UDP send.
//!
//! The capture thread (owned by the NDI runtime wrapper) pushes raw
//! frames into a 3-deep drop-oldest queue; the capture source cannot be
//! slowed, so when encoding falls behind the oldest raw frame is the
//! right thing to lose. A single encode thread drains that queue,
//! configures the encoder lazily from the first frame it sees, and sends
//! encoded video and pass-through audio on the same thread so the socket
//! has exactly one writer.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::codec::encoder::EncoderStatsHandle;
use crate::codec::{EncoderConfig, PixelFormat, VideoEncoder};
use crate::ndi::capture::select_source;
use crate::ndi::{CaptureCallbacks, CaptureConfig, CapturedAudioFrame, CapturedVideoFrame, NdiCapture};
use crate::net::{UdpSender, UdpSenderConfig, UdpSenderStatsHandle};
use crate::queue::FrameQueue;
use crate::BridgeError;

/// Raw video frames buffered between capture and encode.
const VIDEO_QUEUE_CAPACITY: usize = 3;
/// Audio buffers awaiting pass-through send on the encode thread.
const AUDIO_QUEUE_CAPACITY: usize = 16;

/// Host mode configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Substring of the NDI source name to capture.
    pub source_name: Option<String>,
    /// Capture the first discovered source when no name is given.
    pub auto_select: bool,
    pub target_host: String,
    pub target_port: u16,
    pub bitrate_mbps: u32,
    pub mtu: usize,
    pub pacing_delay_us: u64,
    pub discovery_timeout_ms: u32,
    /// Source names containing any of these are skipped by auto-select.
    pub exclude_patterns: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            source_name: None,
            auto_select: false,
            target_host: "127.0.0.1".to_string(),
            target_port: 5990,
            bitrate_mbps: 8,
            mtu: crate::protocol::DEFAULT_MTU,
            pacing_delay_us: 0,
            discovery_timeout_ms: 5_000,
            // Never auto-capture another bridge's output.
            exclude_patterns: vec!["NDI Bridge".to_string()],
        }
    }
}

/// Pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle = 0,
    /// First frame seen, encoder being configured.
    Configuring = 1,
    Streaming = 2,
}

/// Aggregated host-side counters.
#[derive(Debug, Default, Clone)]
pub struct HostStats {
    pub video_frames_captured: u64,
    pub audio_frames_captured: u64,
    pub video_frames_encoded: u64,
    pub keyframes_encoded: u64,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_dropped_eagain: u64,
    pub queue_frames_dropped: u64,
    /// Set when the encoder could not be configured; the pipeline keeps
    /// consuming frames but emits nothing.
    pub encoder_failed: bool,
}

enum SenderWork {
    Audio(CapturedAudioFrame),
}

/// Orchestrates capture, encode and send. `start` wires everything up;
/// `run` blocks until shutdown is requested.
pub struct HostPipeline {
    config: HostConfig,
    capture: Option<NdiCapture>,
    encode_thread: Option<JoinHandle<()>>,
    video_queue: Option<FrameQueue<CapturedVideoFrame>>,
    audio_queue: Option<FrameQueue<SenderWork>>,
    stopped: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    encoder_failed: Arc<AtomicBool>,
    encoder_stats: Option<EncoderStatsHandle>,
    sender_stats: Option<UdpSenderStatsHandle>,
    selected_source: Option<String>,
}

impl HostPipeline {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            capture: None,
            encode_thread: None,
            video_queue: None,
            audio_queue: None,
            stopped: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(PipelineState::Idle as u8)),
            encoder_failed: Arc::new(AtomicBool::new(false)),
            encoder_stats: None,
            sender_stats: None,
            selected_source: None,
        }
    }

    /// Discover, select, connect and spawn the worker threads.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        info!(
            "starting host mode: target {}:{}, {} Mbps",
            self.config.target_host, self.config.target_port, self.config.bitrate_mbps
        );

        // NDI capture and source selection.
        let mut capture = NdiCapture::new(CaptureConfig {
            discovery_timeout_ms: self.config.discovery_timeout_ms,
            ..CaptureConfig::default()
        });
        let sources = capture.discover_sources()?;
        for source in &sources {
            debug!("  found source: {}", source.name);
        }
        let source = select_source(
            &sources,
            self.config.source_name.as_deref(),
            self.config.auto_select,
            &self.config.exclude_patterns,
        )
        .map_err(|e| {
            for source in &sources {
                info!("available source: {}", source.name);
            }
            e
        })?
        .clone();
        self.selected_source = Some(source.name.clone());
        capture.prepare_connect(source);

        // Encoder and network sender must both come up before any frame
        // flows; their absence is a startup failure, not a stream error.
        let mut encoder = VideoEncoder::new()?;
        self.encoder_stats = Some(encoder.stats_handle());

        let mut sender = UdpSender::new(UdpSenderConfig {
            host: self.config.target_host.clone(),
            port: self.config.target_port,
            mtu: self.config.mtu,
            pacing_delay_us: self.config.pacing_delay_us,
        });
        sender.connect()?;
        self.sender_stats = Some(sender.stats_handle());

        let video_queue = FrameQueue::new(VIDEO_QUEUE_CAPACITY);
        let audio_queue = FrameQueue::new(AUDIO_QUEUE_CAPACITY);

        // Encode thread owns encoder and sender for their lifetime.
        let encode_thread = {
            let video_queue = video_queue.clone();
            let audio_queue = audio_queue.clone();
            let stopped = self.stopped.clone();
            let state = self.state.clone();
            let encoder_failed = self.encoder_failed.clone();
            let bitrate = self.config.bitrate_mbps.saturating_mul(1_000_000);

            thread::Builder::new()
                .name("encode".to_string())
                .spawn(move || {
                    encode_loop(
                        encoder,
                        sender,
                        video_queue,
                        audio_queue,
                        stopped,
                        state,
                        encoder_failed,
                        bitrate,
                    );
                })
                .expect("spawn encode thread")
        };

        // Capture callbacks feed the queues; both are drop-oldest so a
        // stalled encoder can never block the capture thread.
        let callbacks = {
            let video_queue = video_queue.clone();
            let audio_queue = audio_queue.clone();
            CaptureCallbacks {
                on_video_frame: Some(Box::new(move |frame| {
                    if video_queue.push(frame) {
                        debug!("video queue full, dropped oldest frame");
                    }
                })),
                on_audio_frame: Some(Box::new(move |frame| {
                    audio_queue.push(SenderWork::Audio(frame));
                })),
                on_error: Some(Box::new(|message| {
                    error!("NDI capture: {}", message);
                })),
            }
        };
        // Register the worker state before the capture thread starts so
        // a failed start still tears everything down through stop().
        self.encode_thread = Some(encode_thread);
        self.video_queue = Some(video_queue);
        self.audio_queue = Some(audio_queue);

        capture.start(callbacks)?;
        self.capture = Some(capture);

        info!(
            "host mode started: {} -> {}:{}",
            self.selected_source.as_deref().unwrap_or("?"),
            self.config.target_host,
            self.config.target_port
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
                    "host: captured v={} a={} encoded={} sent={:.2} MB dropped(queue={} eagain={})",
                    stats.video_frames_captured,
                    stats.audio_frames_captured,
                    stats.video_frames_encoded,
                    stats.bytes_sent as f64 / (1024.0 * 1024.0),
                    stats.queue_frames_dropped,
                    stats.packets_dropped_eagain,
                );
            }
        }
        self.stop();
    }

    /// Tear down threads and components. Idempotent: only the first
    /// caller joins the workers.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping host mode");

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(queue) = &self.video_queue {
            queue.stop();
        }
        if let Some(queue) = &self.audio_queue {
            queue.stop();
        }
        if let Some(thread) = self.encode_thread.take() {
            let _ = thread.join();
        }

        let stats = self.stats();
        info!(
            "host mode stopped: {} video frames encoded, {:.2} MB sent",
            stats.video_frames_encoded,
            stats.bytes_sent as f64 / (1024.0 * 1024.0)
        );
    }

    pub fn state(&self) -> PipelineState {
        match self.state.load(Ordering::Relaxed) {
            1 => PipelineState::Configuring,
            2 => PipelineState::Streaming,
            _ => PipelineState::Idle,
        }
    }

    pub fn stats(&self) -> HostStats {
        let encoder = self
            .encoder_stats
            .as_ref()
            .map(|h| h.snapshot())
            .unwrap_or_default();
        let sender = self
            .sender_stats
            .as_ref()
            .map(|h| h.snapshot())
            .unwrap_or_default();
        HostStats {
            video_frames_captured: self
                .capture
                .as_ref()
                .map(|c| c.video_frames_captured())
                .unwrap_or(0),
            audio_frames_captured: self
                .capture
                .as_ref()
                .map(|c| c.audio_frames_captured())
                .unwrap_or(0),
            video_frames_encoded: encoder.frames_encoded,
            keyframes_encoded: encoder.keyframes_encoded,
            bytes_sent: sender.bytes_sent,
            packets_sent: sender.packets_sent,
            packets_dropped_eagain: sender.packets_dropped_eagain,
            queue_frames_dropped: self
                .video_queue
                .as_ref()
                .map(|q| q.dropped())
                .unwrap_or(0),
            encoder_failed: self.encoder_failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for HostPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Encode-thread body: drain audio, then wait briefly for video.
#[allow(clippy::too_many_arguments)]
fn encode_loop(
    mut encoder: VideoEncoder,
    sender: UdpSender,
    video_queue: FrameQueue<CapturedVideoFrame>,
    audio_queue: FrameQueue<SenderWork>,
    stopped: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    encoder_failed: Arc<AtomicBool>,
    bitrate: u32,
) {
    // The encoder's output callback sends on this same thread; the lock
    // is uncontended and only satisfies the callback's ownership.
    let sender = Arc::new(Mutex::new(sender));
    {
        let sender = sender.clone();
        encoder.set_on_encoded_frame(Box::new(move |frame| {
            let _ = sender
                .lock()
                .send_video(&frame.data, frame.is_keyframe, frame.timestamp);
        }));
    }

    while !stopped.load(Ordering::SeqCst) {
        while let Some(SenderWork::Audio(audio)) = audio_queue.try_pop() {
            let bytes = f32_slice_bytes(&audio.data);
            let _ = sender.lock().send_audio(
                bytes,
                audio.timestamp.max(0) as u64,
                audio.sample_rate,
                audio.channels,
            );
        }

        let Some(frame) = video_queue.pop_timeout(Duration::from_millis(5)) else {
            continue;
        };

        if !encoder.is_configured() && !encoder_failed.load(Ordering::Relaxed) {
            state.store(PipelineState::Configuring as u8, Ordering::Relaxed);
            match configure_from_frame(&mut encoder, &frame, bitrate) {
                Ok(()) => state.store(PipelineState::Streaming as u8, Ordering::Relaxed),
                Err(e) => {
                    // Fatal for output, not for the pipeline: keep
                    // consuming frames so capture stays healthy, and
                    // surface the failure through stats.
                    error!("encoder configuration failed: {}", e);
                    encoder_failed.store(true, Ordering::Relaxed);
                }
            }
        }

        if encoder.is_configured() {
            if let Err(e) = encoder.encode_with_stride(
                &frame.data,
                frame.stride,
                frame.timestamp.max(0) as u64,
            ) {
                debug!("encode error: {}", e);
            }
        }
    }

    encoder.flush();
    sender.lock().disconnect();
}

/// Derive the encoder configuration from the first captured frame.
fn configure_from_frame(
    encoder: &mut VideoEncoder,
    frame: &CapturedVideoFrame,
    bitrate: u32,
) -> Result<(), crate::codec::CodecError> {
    let fps = if frame.frame_rate_n > 0 && frame.frame_rate_d > 0 {
        (frame.frame_rate_n / frame.frame_rate_d).max(1)
    } else {
        30
    };
    let input_format = PixelFormat::from_fourcc(frame.fourcc);

    info!(
        "video: {}x{} @ {} fps, fourcc 0x{:08X} -> {:?}",
        frame.width, frame.height, fps, frame.fourcc, input_format
    );

    encoder.configure(EncoderConfig {
        width: frame.width,
        height: frame.height,
        bitrate,
        fps,
        keyframe_interval: fps,
        input_format,
        ..EncoderConfig::default()
    })
}

/// View a float slice as raw bytes for pass-through sending.
fn f32_slice_bytes(samples: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(samples.as_ptr() as *const u8, samples.len() * 4) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let mut pipeline = HostPipeline::new(HostConfig::default());
        // Never started: stop must not hang or panic, twice.
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_stats_before_start_are_zero() {
        let pipeline = HostPipeline::new(HostConfig::default());
        let stats = pipeline.stats();
        assert_eq!(stats.video_frames_captured, 0);
        assert_eq!(stats.bytes_sent, 0);
        assert!(!stats.encoder_failed);
    }

    #[test]
    fn test_f32_bytes_roundtrip() {
        let samples = [0.5f32, -1.0, 0.25];
        let bytes = f32_slice_bytes(&samples);
        assert_eq!(bytes.len(), 12);
        let back = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(back, 0.5);
    }
}
