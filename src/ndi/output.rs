//! NDI publish sink.
//!
//! Re-broadcasts decoded video and pass-through audio as a new NDI
//! source on the receiving LAN. Frames arrive already paced (by the
//! network or the playout buffer), so the sender is created unclocked
//! and timestamps ride through unchanged.

use std::ffi::{c_int, CString};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::info;

use super::ffi::{self, NdiLib};
use super::NdiError;
use crate::codec::PixelFormat;

/// Publishes frames as an NDI source.
pub struct NdiOutput {
    ndi: &'static NdiLib,
    sender: *mut std::ffi::c_void,
    /// Owns the bytes behind the sender's registered name.
    _name: CString,
    source_name: String,
    frame_rate_n: AtomicU32,
    frame_rate_d: AtomicU32,
    video_frames_sent: AtomicU64,
    audio_frames_sent: AtomicU64,
}

unsafe impl Send for NdiOutput {}
// The NDI send entry points are documented thread-safe; the handle is
// shared read-only behind an Arc.
unsafe impl Sync for NdiOutput {}

impl NdiOutput {
    /// Create and register the NDI source.
    pub fn new(source_name: &str) -> Result<Self, NdiError> {
        let ndi = ffi::load().map_err(NdiError::Unavailable)?;

        let name = CString::new(source_name)
            .map_err(|_| NdiError::SenderCreate("source name contains NUL".into()))?;
        let create = ffi::NDIlibSendCreate {
            p_ndi_name: name.as_ptr(),
            p_groups: std::ptr::null(),
            clock_video: false,
            clock_audio: false,
        };

        let sender = unsafe { (ndi.send_create)(&create) };
        if sender.is_null() {
            return Err(NdiError::SenderCreate("send_create returned null".into()));
        }

        info!("NDI output broadcasting as '{}'", source_name);
        Ok(Self {
            ndi,
            sender,
            _name: name,
            source_name: source_name.to_string(),
            frame_rate_n: AtomicU32::new(30000),
            frame_rate_d: AtomicU32::new(1001),
            video_frames_sent: AtomicU64::new(0),
            audio_frames_sent: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.source_name
    }

    /// Advertise the source frame rate (metadata only; the sender is
    /// unclocked). The wire carries no frame rate, so the receiver
    /// infers it from frame timestamps and updates this as it learns.
    pub fn set_frame_rate(&self, numerator: u32, denominator: u32) {
        if numerator > 0 && denominator > 0 {
            self.frame_rate_n.store(numerator, Ordering::Relaxed);
            self.frame_rate_d.store(denominator, Ordering::Relaxed);
        }
    }

    /// Publish one video frame. `timestamp` is in 100 ns ticks.
    pub fn send_video(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        timestamp: u64,
    ) {
        let four_cc = match format {
            PixelFormat::Bgra => ffi::FOURCC_BGRA,
            PixelFormat::Uyvy => ffi::FOURCC_UYVY,
            PixelFormat::I420 => ffi::FOURCC_I420,
            PixelFormat::Nv12 => ffi::FOURCC_NV12,
        };

        let frame = ffi::NDIlibVideoFrameV2 {
            xres: width as c_int,
            yres: height as c_int,
            four_cc: four_cc as c_int,
            frame_rate_n: self.frame_rate_n.load(Ordering::Relaxed) as c_int,
            frame_rate_d: self.frame_rate_d.load(Ordering::Relaxed) as c_int,
            picture_aspect_ratio: 0.0, // square pixels
            frame_format_type: ffi::FRAME_FORMAT_PROGRESSIVE,
            timecode: i64::MAX, // synthesize
            p_data: data.as_ptr() as *mut u8,
            line_stride_in_bytes: stride as c_int,
            p_metadata: std::ptr::null(),
            timestamp: timestamp as i64,
        };

        unsafe { (self.ndi.send_send_video_v2)(self.sender, &frame) };
        self.video_frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish one audio frame of planar f32 samples (channel 0 first).
    pub fn send_audio(
        &self,
        samples: &[f32],
        sample_rate: u32,
        channels: u8,
        samples_per_channel: u32,
        timestamp: u64,
    ) {
        if channels == 0 || samples_per_channel == 0 {
            return;
        }

        let frame = ffi::NDIlibAudioFrameV2 {
            sample_rate: sample_rate as c_int,
            no_channels: channels as c_int,
            no_samples: samples_per_channel as c_int,
            timecode: i64::MAX, // synthesize
            p_data: samples.as_ptr() as *mut f32,
            channel_stride_in_bytes: (samples_per_channel * 4) as c_int,
            p_metadata: std::ptr::null(),
            timestamp: timestamp as i64,
        };

        unsafe { (self.ndi.send_send_audio_v2)(self.sender, &frame) };
        self.audio_frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of NDI receivers currently connected to this source.
    pub fn connection_count(&self) -> u32 {
        unsafe { (self.ndi.send_get_no_connections)(self.sender, 0).max(0) as u32 }
    }

    pub fn video_frames_sent(&self) -> u64 {
        self.video_frames_sent.load(Ordering::Relaxed)
    }

    pub fn audio_frames_sent(&self) -> u64 {
        self.audio_frames_sent.load(Ordering::Relaxed)
    }
}

impl Drop for NdiOutput {
    fn drop(&mut self) {
        unsafe { (self.ndi.send_destroy)(self.sender) };
        info!("NDI output '{}' stopped", self.source_name);
    }
}
