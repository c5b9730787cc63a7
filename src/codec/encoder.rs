//! H.264 encoding via libx264 through avcodec.
//!
//! Tuned for the latency this pipeline cares about: ultrafast preset,
//! zerolatency tune, no B-frames, no lookahead. zerolatency enables
//! sliced threads, which parallelizes within a frame without adding any
//! frame of delay. Output is Annex-B with SPS/PPS prepended to every
//! keyframe so a receiver can join mid-stream.

use std::ffi::{c_int, CString};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info};

use super::annexb;
use super::ffi::{self, Ffmpeg};
use super::{CodecError, EncodedFrame, PixelFormat};

/// Encoder configuration, fixed at the first captured frame.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub fps: u32,
    /// Force a keyframe every N frames. Matching the frame rate gives
    /// one keyframe per second, which bounds join time after loss.
    pub keyframe_interval: u32,
    pub input_format: PixelFormat,
    pub preset: String,
    pub tune: String,
    pub profile: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            bitrate: 8_000_000,
            fps: 60,
            keyframe_interval: 60,
            input_format: PixelFormat::Uyvy,
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
            profile: "high".to_string(),
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    frames_encoded: AtomicU64,
    keyframes_encoded: AtomicU64,
    bytes_encoded: AtomicU64,
}

/// Snapshot of encoder counters.
#[derive(Debug, Default, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub keyframes_encoded: u64,
    pub bytes_encoded: u64,
}

/// Shared handle for reading encoder counters from another thread.
#[derive(Clone)]
pub struct EncoderStatsHandle {
    stats: Arc<AtomicStats>,
}

impl EncoderStatsHandle {
    pub fn snapshot(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.stats.frames_encoded.load(Ordering::Relaxed),
            keyframes_encoded: self.stats.keyframes_encoded.load(Ordering::Relaxed),
            bytes_encoded: self.stats.bytes_encoded.load(Ordering::Relaxed),
        }
    }
}

type EncodedFrameCallback = Box<dyn FnMut(EncodedFrame) + Send>;

/// H.264 encoder. Owned and driven by a single encode thread; output
/// frames are delivered synchronously from [`VideoEncoder::encode_with_stride`].
pub struct VideoEncoder {
    ffmpeg: &'static Ffmpeg,
    ctx: *mut ffi::AVCodecContext,
    frame: *mut ffi::AVFrame,
    packet: *mut ffi::AVPacket,
    sws: *mut ffi::SwsContext,
    config: EncoderConfig,
    configured: bool,
    frame_number: u64,
    force_next_keyframe: bool,
    stats: Arc<AtomicStats>,
    on_encoded_frame: Option<EncodedFrameCallback>,
}

unsafe impl Send for VideoEncoder {}

impl VideoEncoder {
    /// Fails with [`CodecError::Unavailable`] when FFmpeg cannot be
    /// loaded; actual codec setup happens in [`Self::configure`].
    pub fn new() -> Result<Self, CodecError> {
        let ffmpeg = ffi::load().map_err(CodecError::Unavailable)?;
        Ok(Self {
            ffmpeg,
            ctx: ptr::null_mut(),
            frame: ptr::null_mut(),
            packet: ptr::null_mut(),
            sws: ptr::null_mut(),
            config: EncoderConfig::default(),
            configured: false,
            frame_number: 0,
            force_next_keyframe: false,
            stats: Arc::new(AtomicStats::default()),
            on_encoded_frame: None,
        })
    }

    pub fn set_on_encoded_frame(&mut self, callback: EncodedFrameCallback) {
        self.on_encoded_frame = Some(callback);
    }

    pub fn stats_handle(&self) -> EncoderStatsHandle {
        EncoderStatsHandle {
            stats: self.stats.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Open the codec for the given geometry. Called once, lazily, when
    /// the first captured frame reveals the source format.
    pub fn configure(&mut self, config: EncoderConfig) -> Result<(), CodecError> {
        self.cleanup();
        info!(
            "configuring encoder: {}x{} @ {} fps, {} Mbps, input {:?}",
            config.width,
            config.height,
            config.fps,
            config.bitrate / 1_000_000,
            config.input_format
        );
        self.config = config;

        unsafe {
            self.init_codec()?;
            self.init_scaler()?;
        }

        self.configured = true;
        self.frame_number = 0;
        info!("encoder configured");
        Ok(())
    }

    unsafe fn init_codec(&mut self) -> Result<(), CodecError> {
        let f = self.ffmpeg;

        let name = CString::new("libx264").unwrap();
        let mut codec = (f.avcodec_find_encoder_by_name)(name.as_ptr());
        if codec.is_null() {
            codec = (f.avcodec_find_encoder)(ffi::AV_CODEC_ID_H264);
        }
        if codec.is_null() {
            return Err(CodecError::Configure("no H.264 encoder found".into()));
        }

        self.ctx = (f.avcodec_alloc_context3)(codec);
        if self.ctx.is_null() {
            return Err(CodecError::Configure("failed to allocate codec context".into()));
        }

        let fields = self.ctx as *mut ffi::AVCodecContextFields;
        (*fields).bit_rate = self.config.bitrate as i64;
        (*fields).flags |= ffi::AV_CODEC_FLAG_GLOBAL_HEADER;
        // Protocol timestamps feed straight through as PTS.
        (*fields).time_base = ffi::AVRational {
            num: 1,
            den: crate::protocol::TICKS_PER_SECOND as c_int,
        };
        (*fields).framerate = ffi::AVRational {
            num: self.config.fps as c_int,
            den: 1,
        };
        (*fields).width = self.config.width as c_int;
        (*fields).height = self.config.height as c_int;
        (*fields).pix_fmt = ffi::AV_PIX_FMT_YUV420P;
        // NDI is full range; encode full range BT.709 end to end.
        (*fields).color_range = ffi::AVCOL_RANGE_JPEG;
        (*fields).colorspace = ffi::AVCOL_SPC_BT709;
        (*fields).color_primaries = ffi::AVCOL_PRI_BT709;
        (*fields).color_trc = ffi::AVCOL_TRC_BT709;

        let mut opts: *mut ffi::AVDictionary = ptr::null_mut();
        let mut set = |key: &str, value: &str| {
            let k = CString::new(key).unwrap();
            let v = CString::new(value).unwrap();
            unsafe { (f.av_dict_set)(&mut opts, k.as_ptr(), v.as_ptr(), 0) };
        };
        set("preset", &self.config.preset);
        set("tune", &self.config.tune);
        set("profile", &self.config.profile);
        set("g", &self.config.keyframe_interval.to_string());
        set("bf", "0");
        set("maxrate", &(self.config.bitrate as u64 * 3 / 2).to_string());
        set(
            "bufsize",
            &(self.config.bitrate / self.config.fps.max(1)).to_string(),
        );
        set("threads", "0");
        set("rc-lookahead", "0");
        set("sync-lookahead", "0");
        set("forced-idr", "1");
        set("colorprim", "bt709");
        set("transfer", "bt709");
        set("colormatrix", "bt709");
        set("fullrange", "on");
        // zerolatency turns on sliced threads; leave that alone. Frame
        // threading would buffer N-1 frames.

        let ret = (f.avcodec_open2)(self.ctx, codec, &mut opts);
        (f.av_dict_free)(&mut opts);
        if ret < 0 {
            let msg = ffi::error_string(f, ret);
            error!("failed to open encoder: {}", msg);
            return Err(CodecError::Configure(msg));
        }

        self.frame = (f.av_frame_alloc)();
        self.packet = (f.av_packet_alloc)();
        if self.frame.is_null() || self.packet.is_null() {
            return Err(CodecError::Configure("failed to allocate frame/packet".into()));
        }

        let frame = self.frame as *mut ffi::AVFrameFields;
        (*frame).format = ffi::AV_PIX_FMT_YUV420P;
        (*frame).width = self.config.width as c_int;
        (*frame).height = self.config.height as c_int;
        let ret = (f.av_frame_get_buffer)(self.frame, 32);
        if ret < 0 {
            return Err(CodecError::Configure(ffi::error_string(f, ret)));
        }

        Ok(())
    }

    unsafe fn init_scaler(&mut self) -> Result<(), CodecError> {
        let src_format = match self.config.input_format {
            PixelFormat::Bgra => ffi::AV_PIX_FMT_BGRA,
            PixelFormat::Uyvy => ffi::AV_PIX_FMT_UYVY422,
            PixelFormat::Nv12 => ffi::AV_PIX_FMT_NV12,
            // Already the encoder's native layout; rows are copied in.
            PixelFormat::I420 => return Ok(()),
        };

        let f = self.ffmpeg;
        let w = self.config.width as c_int;
        let h = self.config.height as c_int;
        self.sws = (f.sws_getContext)(
            w,
            h,
            src_format,
            w,
            h,
            ffi::AV_PIX_FMT_YUV420P,
            ffi::SWS_FAST_BILINEAR,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null(),
        );
        if self.sws.is_null() {
            return Err(CodecError::Configure("failed to create pixel converter".into()));
        }

        // Full range on both sides; the default would squeeze into
        // 16-235 and shift every color the decoder later expands.
        let table = (f.sws_getCoefficients)(ffi::SWS_CS_ITU709);
        (f.sws_setColorspaceDetails)(self.sws, table, 1, table, 1, 0, 1 << 16, 1 << 16);

        Ok(())
    }

    /// Encode one raw frame using the tight stride for its format.
    pub fn encode(&mut self, data: &[u8], timestamp: u64) -> Result<(), CodecError> {
        let stride = self.config.input_format.default_stride(self.config.width);
        self.encode_with_stride(data, stride, timestamp)
    }

    /// Encode one raw frame with an explicit first-plane stride.
    ///
    /// Completed access units are delivered synchronously through the
    /// installed callback before this returns.
    pub fn encode_with_stride(
        &mut self,
        data: &[u8],
        stride: u32,
        timestamp: u64,
    ) -> Result<(), CodecError> {
        if !self.configured {
            return Err(CodecError::NotConfigured);
        }

        let f = self.ffmpeg;
        unsafe {
            let ret = (f.av_frame_make_writable)(self.frame);
            if ret < 0 {
                return Err(CodecError::Encode(ffi::error_string(f, ret)));
            }

            self.fill_frame(data, stride)?;

            let frame = self.frame as *mut ffi::AVFrameFields;
            (*frame).pts = timestamp as i64;

            let keyframe_due = self.frame_number == 0
                || self.force_next_keyframe
                || (self.config.keyframe_interval > 0
                    && self.frame_number % self.config.keyframe_interval as u64 == 0);
            (*frame).pict_type = if keyframe_due {
                ffi::AV_PICTURE_TYPE_I
            } else {
                ffi::AV_PICTURE_TYPE_NONE
            };
            self.force_next_keyframe = false;
            self.frame_number += 1;

            let ret = (f.avcodec_send_frame)(self.ctx, self.frame);
            if ret < 0 {
                return Err(CodecError::Encode(ffi::error_string(f, ret)));
            }

            self.drain_packets()
        }
    }

    /// Copy or convert the input pixels into the encoder frame.
    unsafe fn fill_frame(&mut self, data: &[u8], stride: u32) -> Result<(), CodecError> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let frame = self.frame as *mut ffi::AVFrameFields;

        if self.sws.is_null() {
            // I420 input: per-plane row copy honoring both strides.
            let src_stride = stride as usize;
            if data.len() < src_stride * h + (src_stride / 2) * h {
                return Err(CodecError::Encode("short I420 frame".into()));
            }
            let y_src = &data[..src_stride * h];
            let u_src = &data[src_stride * h..src_stride * h + (src_stride / 2) * (h / 2)];
            let v_src = &data[src_stride * h + (src_stride / 2) * (h / 2)..];

            copy_plane((*frame).data[0], (*frame).linesize[0] as usize, y_src, src_stride, w, h);
            copy_plane((*frame).data[1], (*frame).linesize[1] as usize, u_src, src_stride / 2, w / 2, h / 2);
            copy_plane((*frame).data[2], (*frame).linesize[2] as usize, v_src, src_stride / 2, w / 2, h / 2);
            return Ok(());
        }

        let (src_slices, src_strides): ([*const u8; 4], [c_int; 4]) =
            match self.config.input_format {
                PixelFormat::Bgra | PixelFormat::Uyvy => (
                    [data.as_ptr(), ptr::null(), ptr::null(), ptr::null()],
                    [stride as c_int, 0, 0, 0],
                ),
                PixelFormat::Nv12 => (
                    [
                        data.as_ptr(),
                        data.as_ptr().add(stride as usize * h),
                        ptr::null(),
                        ptr::null(),
                    ],
                    [stride as c_int, stride as c_int, 0, 0],
                ),
                PixelFormat::I420 => unreachable!("I420 copies planes directly"),
            };

        let scaled = (self.ffmpeg.sws_scale)(
            self.sws,
            src_slices.as_ptr(),
            src_strides.as_ptr(),
            0,
            h as c_int,
            (*frame).data.as_ptr() as *const *mut u8,
            (*frame).linesize.as_ptr(),
        );
        if scaled != h as c_int {
            return Err(CodecError::Convert("pixel conversion fell short".into()));
        }
        Ok(())
    }

    unsafe fn drain_packets(&mut self) -> Result<(), CodecError> {
        let f = self.ffmpeg;
        loop {
            let ret = (f.avcodec_receive_packet)(self.ctx, self.packet);
            if ret == ffi::AVERROR_EAGAIN || ret == ffi::AVERROR_EOF {
                return Ok(());
            }
            if ret < 0 {
                return Err(CodecError::Encode(ffi::error_string(f, ret)));
            }
            self.emit_packet();
            (f.av_packet_unref)(self.packet);
        }
    }

    /// Turn one avcodec packet into an Annex-B access unit, prepending
    /// SPS/PPS from extradata when this is a keyframe.
    unsafe fn emit_packet(&mut self) {
        let pkt = self.packet as *const ffi::AVPacketFields;
        let is_keyframe = (*pkt).flags & ffi::AV_PKT_FLAG_KEY != 0;
        let data = std::slice::from_raw_parts((*pkt).data, (*pkt).size as usize);

        let mut annexb_data = Vec::with_capacity(data.len() + 256);

        if is_keyframe {
            let fields = self.ctx as *const ffi::AVCodecContextFields;
            let extra_ptr = (*fields).extradata;
            let extra_size = (*fields).extradata_size;
            if !extra_ptr.is_null() && extra_size > 0 {
                let extra = std::slice::from_raw_parts(extra_ptr, extra_size as usize);
                if annexb::starts_with_start_code(extra) {
                    annexb_data.extend_from_slice(extra);
                } else if let Some(converted) = annexb::avcc_extradata_to_annexb(extra) {
                    annexb_data.extend_from_slice(&converted);
                } else {
                    debug!("unrecognized extradata layout ({} bytes)", extra_size);
                }
            }
        }

        if annexb::starts_with_start_code(data) {
            annexb_data.extend_from_slice(data);
        } else {
            annexb_data.extend_from_slice(&annexb::avcc_packet_to_annexb(data));
        }

        self.stats.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_encoded
            .fetch_add(annexb_data.len() as u64, Ordering::Relaxed);
        if is_keyframe {
            self.stats.keyframes_encoded.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(cb) = &mut self.on_encoded_frame {
            cb(EncodedFrame {
                data: annexb_data,
                is_keyframe,
                timestamp: (*pkt).pts as u64,
            });
        }
    }

    /// Make the next encoded frame a keyframe regardless of cadence.
    pub fn force_keyframe(&mut self) {
        self.force_next_keyframe = true;
    }

    /// Restart the stream: flush codec state and begin a new GOP.
    pub fn reset(&mut self) {
        if !self.ctx.is_null() {
            unsafe { (self.ffmpeg.avcodec_flush_buffers)(self.ctx) };
        }
        self.frame_number = 0;
        self.force_next_keyframe = true;
    }

    /// Drain any delayed packets at shutdown.
    pub fn flush(&mut self) {
        if !self.configured {
            return;
        }
        let f = self.ffmpeg;
        unsafe {
            (f.avcodec_send_frame)(self.ctx, ptr::null());
            let _ = self.drain_packets();
        }
    }

    fn cleanup(&mut self) {
        let f = self.ffmpeg;
        unsafe {
            if !self.ctx.is_null() {
                (f.avcodec_free_context)(&mut self.ctx);
            }
            if !self.frame.is_null() {
                (f.av_frame_free)(&mut self.frame);
            }
            if !self.packet.is_null() {
                (f.av_packet_free)(&mut self.packet);
            }
            if !self.sws.is_null() {
                (f.sws_freeContext)(self.sws);
                self.sws = ptr::null_mut();
            }
        }
        self.configured = false;
        self.frame_number = 0;
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Row-by-row plane copy between differing strides.
unsafe fn copy_plane(
    dst: *mut u8,
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let src_row = &src[row * src_stride..row * src_stride + width];
        std::ptr::copy_nonoverlapping(src_row.as_ptr(), dst.add(row * dst_stride), width);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::annexb::{parse_nal_units, NAL_TYPE_IDR, NAL_TYPE_PPS, NAL_TYPE_SPS};
    use std::sync::mpsc;

    fn test_config() -> EncoderConfig {
        EncoderConfig {
            width: 64,
            height: 64,
            bitrate: 500_000,
            fps: 30,
            keyframe_interval: 5,
            input_format: PixelFormat::Bgra,
            ..EncoderConfig::default()
        }
    }

    #[test]
    fn test_encode_requires_configure() {
        let Ok(mut encoder) = VideoEncoder::new() else {
            println!("ffmpeg not available, skipping");
            return;
        };
        let frame = vec![0u8; 64 * 64 * 4];
        assert!(matches!(
            encoder.encode(&frame, 0),
            Err(CodecError::NotConfigured)
        ));
    }

    #[test]
    fn test_first_frame_is_annexb_keyframe() {
        let Ok(mut encoder) = VideoEncoder::new() else {
            println!("ffmpeg not available, skipping");
            return;
        };
        let (tx, rx) = mpsc::channel();
        encoder.set_on_encoded_frame(Box::new(move |f| tx.send(f).unwrap()));
        if encoder.configure(test_config()).is_err() {
            println!("no H.264 encoder in this ffmpeg build, skipping");
            return;
        }

        let frame = vec![0x80u8; 64 * 64 * 4];
        for i in 0..3 {
            encoder.encode(&frame, i * 333_333).unwrap();
        }
        encoder.flush();

        let first = rx.recv().unwrap();
        assert!(first.is_keyframe);
        assert_eq!(first.timestamp, 0);

        // Keyframe shape: SPS and PPS before the IDR slice.
        let types: Vec<u8> = parse_nal_units(&first.data)
            .iter()
            .map(|n| n.nal_type)
            .collect();
        assert!(types.contains(&NAL_TYPE_SPS));
        assert!(types.contains(&NAL_TYPE_PPS));
        assert!(types.contains(&NAL_TYPE_IDR));
        let sps_pos = types.iter().position(|&t| t == NAL_TYPE_SPS).unwrap();
        let idr_pos = types.iter().position(|&t| t == NAL_TYPE_IDR).unwrap();
        assert!(sps_pos < idr_pos);
    }

    #[test]
    fn test_keyframe_cadence_and_forcing() {
        let Ok(mut encoder) = VideoEncoder::new() else {
            println!("ffmpeg not available, skipping");
            return;
        };
        let (tx, rx) = mpsc::channel();
        encoder.set_on_encoded_frame(Box::new(move |f| tx.send(f).unwrap()));
        if encoder.configure(test_config()).is_err() {
            println!("no H.264 encoder in this ffmpeg build, skipping");
            return;
        }

        let frame = vec![0x40u8; 64 * 64 * 4];
        for i in 0..7 {
            if i == 2 {
                encoder.force_keyframe();
            }
            encoder.encode(&frame, i as u64).unwrap();
        }
        encoder.flush();

        let frames: Vec<EncodedFrame> = rx.try_iter().collect();
        assert_eq!(frames.len(), 7);
        assert!(frames[0].is_keyframe); // frame 0
        assert!(frames[2].is_keyframe); // forced
        assert!(frames[5].is_keyframe); // interval 5
        assert!(!frames[1].is_keyframe);

        let stats = encoder.stats_handle().snapshot();
        assert_eq!(stats.frames_encoded, 7);
        assert!(stats.keyframes_encoded >= 3);
    }
}
