//! NDI source discovery and frame capture.
//!
//! Discovery is a synchronous scan; capture runs on a dedicated thread.
//! Connection setup happens on the capture thread itself, not the
//! caller's thread: the NDI runtime wants the connecting thread to be
//! the one that pumps the receive loop, so `prepare_connect` only stores
//! the target and the thread performs the actual connect on its first
//! iteration.

use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use super::ffi::{self, NdiLib};
use super::{CapturedAudioFrame, CapturedVideoFrame, NdiError, NdiSource};

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Name this receiver advertises to the NDI source.
    pub receiver_name: String,
    /// How long discovery scans the network.
    pub discovery_timeout_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            receiver_name: "NDI Bridge Receiver".to_string(),
            discovery_timeout_ms: 5_000,
        }
    }
}

/// Callbacks fired from the capture thread.
#[derive(Default)]
pub struct CaptureCallbacks {
    pub on_video_frame: Option<Box<dyn FnMut(CapturedVideoFrame) + Send>>,
    pub on_audio_frame: Option<Box<dyn FnMut(CapturedAudioFrame) + Send>>,
    pub on_error: Option<Box<dyn Fn(&str) + Send>>,
}

#[derive(Default)]
struct AtomicStats {
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
}

/// Captures video and audio from one NDI source.
pub struct NdiCapture {
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    pending_source: Option<NdiSource>,
    stats: Arc<AtomicStats>,
}

impl NdiCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            pending_source: None,
            stats: Arc::new(AtomicStats::default()),
        }
    }

    /// Scan the network for NDI sources for the configured timeout.
    pub fn discover_sources(&self) -> Result<Vec<NdiSource>, NdiError> {
        let ndi = ffi::load().map_err(NdiError::Unavailable)?;
        discover(ndi, self.config.discovery_timeout_ms)
    }

    /// Remember the source to capture; the capture thread connects.
    pub fn prepare_connect(&mut self, source: NdiSource) {
        info!("selected source: {}", source.name);
        self.pending_source = Some(source);
    }

    /// Spawn the capture thread. Requires a prepared source.
    pub fn start(&mut self, callbacks: CaptureCallbacks) -> Result<(), NdiError> {
        if self.thread.is_some() {
            return Err(NdiError::AlreadyRunning);
        }
        let source = self
            .pending_source
            .clone()
            .ok_or(NdiError::NoSourcePrepared)?;
        let ndi = ffi::load().map_err(NdiError::Unavailable)?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let stats = self.stats.clone();
        let receiver_name = self.config.receiver_name.clone();

        self.thread = Some(
            thread::Builder::new()
                .name("ndi-capture".to_string())
                .spawn(move || {
                    capture_loop(ndi, source, receiver_name, running, callbacks, stats);
                })
                .expect("spawn ndi capture thread"),
        );
        Ok(())
    }

    /// Stop the capture thread. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!(
                "capture stopped: {} video frames, {} audio frames",
                self.stats.video_frames.load(Ordering::Relaxed),
                self.stats.audio_frames.load(Ordering::Relaxed)
            );
        }
    }

    pub fn video_frames_captured(&self) -> u64 {
        self.stats.video_frames.load(Ordering::Relaxed)
    }

    pub fn audio_frames_captured(&self) -> u64 {
        self.stats.audio_frames.load(Ordering::Relaxed)
    }
}

impl Drop for NdiCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocking source scan.
fn discover(ndi: &'static NdiLib, timeout_ms: u32) -> Result<Vec<NdiSource>, NdiError> {
    unsafe {
        let create = ffi::NDIlibFindCreate {
            show_local_sources: true,
            p_groups: std::ptr::null(),
            p_extra_ips: std::ptr::null(),
        };
        let finder = (ndi.find_create_v2)(&create);
        if finder.is_null() {
            return Err(NdiError::Init("find_create_v2 returned null".into()));
        }

        // Let the scan run for the whole timeout; sources trickle in as
        // mDNS answers arrive.
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = (deadline - now).as_millis() as u32;
            (ndi.find_wait_for_sources)(finder, remaining.min(500));
        }

        let mut count: u32 = 0;
        let sources_ptr = (ndi.find_get_current_sources)(finder, &mut count);
        let mut sources = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let raw = &*sources_ptr.add(i);
            let name = if raw.p_ndi_name.is_null() {
                String::new()
            } else {
                CStr::from_ptr(raw.p_ndi_name).to_string_lossy().into_owned()
            };
            let address = if raw.p_url_address.is_null() {
                String::new()
            } else {
                CStr::from_ptr(raw.p_url_address)
                    .to_string_lossy()
                    .into_owned()
            };
            sources.push(NdiSource { name, address });
        }

        (ndi.find_destroy)(finder);
        info!("discovered {} NDI source(s)", sources.len());
        Ok(sources)
    }
}

fn capture_loop(
    ndi: &'static NdiLib,
    source: NdiSource,
    receiver_name: String,
    running: Arc<AtomicBool>,
    mut callbacks: CaptureCallbacks,
    stats: Arc<AtomicStats>,
) {
    unsafe {
        let recv_name = CString::new(receiver_name).unwrap_or_default();
        let create = ffi::NDIlibRecvCreateV3 {
            source_to_connect_to: ffi::NDIlibSource::empty(),
            color_format: ffi::RECV_COLOR_FORMAT_UYVY_BGRA,
            bandwidth: ffi::RECV_BANDWIDTH_HIGHEST,
            allow_video_fields: false,
            p_ndi_recv_name: recv_name.as_ptr(),
        };
        let receiver = (ndi.recv_create_v3)(&create);
        if receiver.is_null() {
            error!("failed to create NDI receiver");
            if let Some(cb) = &callbacks.on_error {
                cb("failed to create NDI receiver");
            }
            return;
        }

        // Deferred connect, on this thread.
        let name = CString::new(source.name.clone()).unwrap_or_default();
        let address = CString::new(source.address.clone()).unwrap_or_default();
        let raw_source = ffi::NDIlibSource {
            p_ndi_name: name.as_ptr(),
            p_url_address: if source.address.is_empty() {
                std::ptr::null()
            } else {
                address.as_ptr()
            },
        };
        (ndi.recv_connect)(receiver, &raw_source);
        info!("connected to NDI source: {}", source.name);

        while running.load(Ordering::SeqCst) {
            let mut video = ffi::NDIlibVideoFrameV2::zeroed();
            let mut audio = ffi::NDIlibAudioFrameV2::zeroed();

            let frame_type = (ndi.recv_capture_v2)(
                receiver,
                &mut video,
                &mut audio,
                std::ptr::null_mut(),
                100,
            );

            match frame_type {
                ffi::FRAME_TYPE_VIDEO => {
                    if !video.p_data.is_null() && video.xres > 0 && video.yres > 0 {
                        let stride = video.line_stride_in_bytes as usize;
                        let size = stride * video.yres as usize;
                        let data = std::slice::from_raw_parts(video.p_data, size).to_vec();
                        stats.video_frames.fetch_add(1, Ordering::Relaxed);
                        if let Some(cb) = &mut callbacks.on_video_frame {
                            cb(CapturedVideoFrame {
                                data,
                                width: video.xres as u32,
                                height: video.yres as u32,
                                stride: stride as u32,
                                fourcc: video.four_cc as u32,
                                frame_rate_n: video.frame_rate_n.max(0) as u32,
                                frame_rate_d: video.frame_rate_d.max(0) as u32,
                                timestamp: video.timestamp,
                            });
                        }
                    }
                    (ndi.recv_free_video_v2)(receiver, &mut video);
                }
                ffi::FRAME_TYPE_AUDIO => {
                    if !audio.p_data.is_null() && audio.no_samples > 0 && audio.no_channels > 0 {
                        let samples = audio.no_samples as usize;
                        let channels = audio.no_channels as usize;
                        // Planar copy, channel by channel; the stride
                        // between channels may exceed the sample count.
                        let channel_stride = audio.channel_stride_in_bytes as usize / 4;
                        let mut data = vec![0.0f32; samples * channels];
                        for ch in 0..channels {
                            let src = audio.p_data.add(ch * channel_stride);
                            std::ptr::copy_nonoverlapping(
                                src,
                                data.as_mut_ptr().add(ch * samples),
                                samples,
                            );
                        }
                        stats.audio_frames.fetch_add(1, Ordering::Relaxed);
                        if let Some(cb) = &mut callbacks.on_audio_frame {
                            cb(CapturedAudioFrame {
                                data,
                                sample_rate: audio.sample_rate.max(0) as u32,
                                channels: channels as u8,
                                samples_per_channel: samples as u32,
                                timestamp: audio.timestamp,
                            });
                        }
                    }
                    (ndi.recv_free_audio_v2)(receiver, &mut audio);
                }
                ffi::FRAME_TYPE_ERROR => {
                    error!("NDI capture error from source");
                    if let Some(cb) = &callbacks.on_error {
                        cb("NDI capture error");
                    }
                }
                ffi::FRAME_TYPE_NONE | ffi::FRAME_TYPE_METADATA | ffi::FRAME_TYPE_STATUS_CHANGE => {}
                other => debug!("unhandled NDI frame type {}", other),
            }
        }

        (ndi.recv_destroy)(receiver);
    }
}

/// Pick a capture source: explicit substring match first, then
/// auto-select, excluding any name containing an exclude pattern.
pub fn select_source<'a>(
    sources: &'a [NdiSource],
    name_filter: Option<&str>,
    auto_select: bool,
    exclude_patterns: &[String],
) -> Result<&'a NdiSource, NdiError> {
    if sources.is_empty() {
        return Err(NdiError::NoSources);
    }

    if let Some(wanted) = name_filter {
        // Explicit requests search everything, even excluded names.
        return sources
            .iter()
            .find(|s| s.name.contains(wanted))
            .ok_or_else(|| NdiError::SourceNotFound(wanted.to_string()));
    }

    let excluded = |name: &str| {
        let lower = name.to_lowercase();
        exclude_patterns
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
    };

    if auto_select {
        return sources
            .iter()
            .find(|s| !excluded(&s.name))
            .ok_or(NdiError::NoSources);
    }

    Err(NdiError::NoSourcePrepared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<NdiSource> {
        vec![
            NdiSource {
                name: "HOST-A (NDI Bridge)".to_string(),
                address: String::new(),
            },
            NdiSource {
                name: "HOST-B (OBS Camera)".to_string(),
                address: "192.168.1.20:5961".to_string(),
            },
            NdiSource {
                name: "HOST-C (Studio Monitor)".to_string(),
                address: String::new(),
            },
        ]
    }

    #[test]
    fn test_select_by_substring() {
        let sources = sources();
        let chosen = select_source(&sources, Some("OBS"), false, &[]).unwrap();
        assert_eq!(chosen.name, "HOST-B (OBS Camera)");
    }

    #[test]
    fn test_select_missing_name() {
        let sources = sources();
        assert!(matches!(
            select_source(&sources, Some("vMix"), false, &[]),
            Err(NdiError::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_auto_select_skips_excluded() {
        let sources = sources();
        // Excluding our own bridge output avoids a capture loop when
        // host and join run on the same LAN.
        let exclude = vec!["ndi bridge".to_string()];
        let chosen = select_source(&sources, None, true, &exclude).unwrap();
        assert_eq!(chosen.name, "HOST-B (OBS Camera)");
    }

    #[test]
    fn test_explicit_name_beats_exclusion() {
        let sources = sources();
        let exclude = vec!["bridge".to_string()];
        let chosen = select_source(&sources, Some("Bridge"), false, &exclude).unwrap();
        assert_eq!(chosen.name, "HOST-A (NDI Bridge)");
    }

    #[test]
    fn test_no_selection_mode() {
        let sources = sources();
        assert!(matches!(
            select_source(&sources, None, false, &[]),
            Err(NdiError::NoSourcePrepared)
        ));
        let empty: Vec<NdiSource> = Vec::new();
        assert!(matches!(
            select_source(&empty, None, true, &[]),
            Err(NdiError::NoSources)
        ));
    }
}
