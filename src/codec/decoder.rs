//! H.264 decoding via avcodec.
//!
//! The decoder refuses input until it has seen SPS and PPS, then feeds
//! each access unit to avcodec as a single packet so every input
//! produces exactly one output frame (per-NAL submission makes the
//! decoder conceal "missing" slices). Output is converted to the
//! requested pixel format with full-range coefficients and written into
//! a persistent buffer that is reused across frames.

use std::ffi::c_int;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info};

use super::annexb::{self, NAL_TYPE_IDR, NAL_TYPE_PPS, NAL_TYPE_SPS};
use super::ffi::{self, Ffmpeg};
use super::{CodecError, DecodedFrame, PixelFormat};

/// Decoder configuration.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Pixel format delivered to the output callback.
    pub output_format: PixelFormat,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            output_format: PixelFormat::Bgra,
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    frames_decoded: AtomicU64,
    keyframes_decoded: AtomicU64,
    decode_errors: AtomicU64,
    decode_latency_total_us: AtomicU64,
    decode_latency_max_us: AtomicU64,
}

/// Snapshot of decoder counters.
#[derive(Debug, Default, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub keyframes_decoded: u64,
    pub decode_errors: u64,
    pub avg_decode_latency_us: u64,
    pub max_decode_latency_us: u64,
}

/// Shared handle for reading decoder counters from another thread.
#[derive(Clone)]
pub struct DecoderStatsHandle {
    stats: Arc<AtomicStats>,
}

impl DecoderStatsHandle {
    pub fn snapshot(&self) -> DecoderStats {
        let frames = self.stats.frames_decoded.load(Ordering::Relaxed);
        let total = self.stats.decode_latency_total_us.load(Ordering::Relaxed);
        DecoderStats {
            frames_decoded: frames,
            keyframes_decoded: self.stats.keyframes_decoded.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
            avg_decode_latency_us: if frames > 0 { total / frames } else { 0 },
            max_decode_latency_us: self.stats.decode_latency_max_us.load(Ordering::Relaxed),
        }
    }
}

type DecodedFrameCallback = Box<dyn FnMut(&DecodedFrame) + Send>;

/// H.264 decoder. Owned and driven by a single decode thread.
pub struct VideoDecoder {
    ffmpeg: &'static Ffmpeg,
    ctx: *mut ffi::AVCodecContext,
    frame: *mut ffi::AVFrame,
    packet: *mut ffi::AVPacket,
    sws: *mut ffi::SwsContext,
    config: DecoderConfig,
    configured: bool,
    /// Both parameter sets observed at least once.
    ready: bool,
    sps: Vec<u8>,
    pps: Vec<u8>,
    width: u32,
    height: u32,
    src_format: c_int,
    output: DecodedFrame,
    stats: Arc<AtomicStats>,
    on_decoded_frame: Option<DecodedFrameCallback>,
}

unsafe impl Send for VideoDecoder {}

impl VideoDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let ffmpeg = ffi::load().map_err(CodecError::Unavailable)?;
        Ok(Self {
            ffmpeg,
            ctx: ptr::null_mut(),
            frame: ptr::null_mut(),
            packet: ptr::null_mut(),
            sws: ptr::null_mut(),
            config: DecoderConfig::default(),
            configured: false,
            ready: false,
            sps: Vec::new(),
            pps: Vec::new(),
            width: 0,
            height: 0,
            src_format: -1,
            output: DecodedFrame::default(),
            stats: Arc::new(AtomicStats::default()),
            on_decoded_frame: None,
        })
    }

    pub fn set_on_decoded_frame(&mut self, callback: DecodedFrameCallback) {
        self.on_decoded_frame = Some(callback);
    }

    pub fn stats_handle(&self) -> DecoderStatsHandle {
        DecoderStatsHandle {
            stats: self.stats.clone(),
        }
    }

    /// True once SPS and PPS have both been observed.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Open the H.264 decoder. Single-threaded software decoding: frame
    /// threading would add a frame of latency per extra thread.
    pub fn configure(&mut self, config: DecoderConfig) -> Result<(), CodecError> {
        self.cleanup();
        self.config = config;
        info!(
            "configuring decoder, output format {:?}",
            self.config.output_format
        );

        let f = self.ffmpeg;
        unsafe {
            let codec = (f.avcodec_find_decoder)(ffi::AV_CODEC_ID_H264);
            if codec.is_null() {
                return Err(CodecError::Configure("no H.264 decoder found".into()));
            }

            self.ctx = (f.avcodec_alloc_context3)(codec);
            if self.ctx.is_null() {
                return Err(CodecError::Configure("failed to allocate codec context".into()));
            }

            let fields = self.ctx as *mut ffi::AVCodecContextFields;
            (*fields).flags |= ffi::AV_CODEC_FLAG_LOW_DELAY;
            (*fields).flags2 |= ffi::AV_CODEC_FLAG2_FAST;

            let mut opts: *mut ffi::AVDictionary = ptr::null_mut();
            let key = std::ffi::CString::new("threads").unwrap();
            let value = std::ffi::CString::new("1").unwrap();
            (f.av_dict_set)(&mut opts, key.as_ptr(), value.as_ptr(), 0);

            let ret = (f.avcodec_open2)(self.ctx, codec, &mut opts);
            (f.av_dict_free)(&mut opts);
            if ret < 0 {
                let msg = ffi::error_string(f, ret);
                error!("failed to open decoder: {}", msg);
                return Err(CodecError::Configure(msg));
            }

            self.frame = (f.av_frame_alloc)();
            self.packet = (f.av_packet_alloc)();
            if self.frame.is_null() || self.packet.is_null() {
                return Err(CodecError::Configure("failed to allocate frame/packet".into()));
            }
        }

        self.configured = true;
        info!("decoder configured, waiting for parameter sets");
        Ok(())
    }

    /// Decode one Annex-B access unit.
    ///
    /// Input before the first SPS/PPS pair is discarded silently: a
    /// receiver joining mid-stream simply waits for the next keyframe.
    pub fn decode(&mut self, data: &[u8], timestamp: u64) -> Result<(), CodecError> {
        if !self.configured {
            return Err(CodecError::NotConfigured);
        }

        let mut has_idr = false;
        for nal in annexb::parse_nal_units(data) {
            match nal.nal_type {
                NAL_TYPE_SPS => {
                    if self.sps != nal.data {
                        debug!(
                            "received SPS ({} bytes){}",
                            nal.data.len(),
                            if self.sps.is_empty() { "" } else { " (changed)" }
                        );
                        self.sps = nal.data.to_vec();
                    }
                }
                NAL_TYPE_PPS => {
                    if self.pps != nal.data {
                        debug!(
                            "received PPS ({} bytes){}",
                            nal.data.len(),
                            if self.pps.is_empty() { "" } else { " (changed)" }
                        );
                        self.pps = nal.data.to_vec();
                    }
                    if !self.ready && !self.sps.is_empty() {
                        self.ready = true;
                        info!("decoder ready (SPS/PPS received)");
                    }
                }
                NAL_TYPE_IDR => has_idr = true,
                _ => {}
            }
        }

        if !self.ready {
            debug!("waiting for keyframe (no SPS/PPS yet)");
            return Ok(());
        }

        if has_idr {
            self.stats.keyframes_decoded.fetch_add(1, Ordering::Relaxed);
        }

        let f = self.ffmpeg;
        let started = Instant::now();
        unsafe {
            (f.av_packet_unref)(self.packet);
            let pkt = self.packet as *mut ffi::AVPacketFields;
            (*pkt).data = data.as_ptr() as *mut u8;
            (*pkt).size = data.len() as c_int;
            (*pkt).pts = timestamp as i64;
            (*pkt).dts = timestamp as i64;

            let ret = (f.avcodec_send_packet)(self.ctx, self.packet);
            if ret < 0 && ret != ffi::AVERROR_EAGAIN {
                if ret == ffi::AVERROR_EOF {
                    return Ok(());
                }
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                return Err(CodecError::Decode(ffi::error_string(f, ret)));
            }

            loop {
                let ret = (f.avcodec_receive_frame)(self.ctx, self.frame);
                if ret == ffi::AVERROR_EAGAIN || ret == ffi::AVERROR_EOF {
                    break;
                }
                if ret < 0 {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(CodecError::Decode(ffi::error_string(f, ret)));
                }

                let latency_us = started.elapsed().as_micros() as u64;
                self.stats
                    .decode_latency_total_us
                    .fetch_add(latency_us, Ordering::Relaxed);
                self.stats
                    .decode_latency_max_us
                    .fetch_max(latency_us, Ordering::Relaxed);

                self.deliver_frame(timestamp)?;
                (f.av_frame_unref)(self.frame);
            }
        }

        Ok(())
    }

    /// Convert the decoded frame into the persistent output buffer and
    /// hand it to the callback.
    unsafe fn deliver_frame(&mut self, timestamp: u64) -> Result<(), CodecError> {
        let frame = self.frame as *const ffi::AVFrameFields;
        let width = (*frame).width as u32;
        let height = (*frame).height as u32;
        let src_format = (*frame).format;

        if width == 0 || height == 0 {
            return Ok(());
        }

        if width != self.width || height != self.height || src_format != self.src_format {
            self.width = width;
            self.height = height;
            self.src_format = src_format;
            info!("video dimensions: {}x{}", width, height);
            self.init_scaler()?;
        }

        self.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);

        let w = width as usize;
        let h = height as usize;

        if !self.sws.is_null() {
            let dst_stride = self.config.output_format.default_stride(width) as usize;
            self.output.data.resize(dst_stride * h, 0);
            let dst_slices: [*mut u8; 1] = [self.output.data.as_mut_ptr()];
            let dst_strides: [c_int; 1] = [dst_stride as c_int];

            let scaled = (self.ffmpeg.sws_scale)(
                self.sws,
                (*frame).data.as_ptr() as *const *const u8,
                (*frame).linesize.as_ptr(),
                0,
                h as c_int,
                dst_slices.as_ptr(),
                dst_strides.as_ptr(),
            );
            if scaled <= 0 {
                return Err(CodecError::Convert("pixel conversion failed".into()));
            }
            self.output.stride = dst_stride as u32;
        } else {
            // Native planar output requested: pack the planes tightly.
            let y_stride = (*frame).linesize[0] as usize;
            let u_stride = (*frame).linesize[1] as usize;
            let v_stride = (*frame).linesize[2] as usize;
            self.output.data.resize(w * h * 3 / 2, 0);

            for row in 0..h {
                let dst = &mut self.output.data[row * w..row * w + w];
                ptr::copy_nonoverlapping((*frame).data[0].add(row * y_stride), dst.as_mut_ptr(), w);
            }
            let u_base = w * h;
            for row in 0..h / 2 {
                let dst = &mut self.output.data[u_base + row * w / 2..u_base + row * w / 2 + w / 2];
                ptr::copy_nonoverlapping((*frame).data[1].add(row * u_stride), dst.as_mut_ptr(), w / 2);
            }
            let v_base = w * h + w * h / 4;
            for row in 0..h / 2 {
                let dst = &mut self.output.data[v_base + row * w / 2..v_base + row * w / 2 + w / 2];
                ptr::copy_nonoverlapping((*frame).data[2].add(row * v_stride), dst.as_mut_ptr(), w / 2);
            }
            self.output.stride = w as u32;
        }

        self.output.width = width;
        self.output.height = height;
        self.output.format = Some(self.config.output_format);
        self.output.timestamp = timestamp;

        if let Some(cb) = &mut self.on_decoded_frame {
            cb(&self.output);
        }
        Ok(())
    }

    /// (Re)build the converter for the current dimensions and source
    /// format. Full range on both sides: the encoder produces JPEG-range
    /// video and swscale would otherwise assume the 16-235 studio range
    /// and shift every color.
    unsafe fn init_scaler(&mut self) -> Result<(), CodecError> {
        let f = self.ffmpeg;
        if !self.sws.is_null() {
            (f.sws_freeContext)(self.sws);
            self.sws = ptr::null_mut();
        }

        let dst_format = match self.config.output_format {
            PixelFormat::Bgra => ffi::AV_PIX_FMT_BGRA,
            PixelFormat::Uyvy => ffi::AV_PIX_FMT_UYVY422,
            PixelFormat::Nv12 => ffi::AV_PIX_FMT_NV12,
            PixelFormat::I420 => ffi::AV_PIX_FMT_YUV420P,
        };
        if dst_format == self.src_format {
            debug!("no pixel conversion needed");
            return Ok(());
        }

        self.sws = (f.sws_getContext)(
            self.width as c_int,
            self.height as c_int,
            self.src_format,
            self.width as c_int,
            self.height as c_int,
            dst_format,
            ffi::SWS_FAST_BILINEAR,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null(),
        );
        if self.sws.is_null() {
            return Err(CodecError::Convert("failed to create pixel converter".into()));
        }

        let table = (f.sws_getCoefficients)(ffi::SWS_CS_ITU709);
        (f.sws_setColorspaceDetails)(self.sws, table, 1, table, 1, 0, 1 << 16, 1 << 16);
        Ok(())
    }

    /// Drain delayed frames at shutdown.
    pub fn flush(&mut self) {
        if !self.configured {
            return;
        }
        let f = self.ffmpeg;
        unsafe {
            (f.avcodec_send_packet)(self.ctx, ptr::null());
            loop {
                let ret = (f.avcodec_receive_frame)(self.ctx, self.frame);
                if ret < 0 {
                    break;
                }
                let _ = self.deliver_frame(self.output.timestamp);
                (f.av_frame_unref)(self.frame);
            }
        }
    }

    /// Forget stream state so the decoder re-syncs on the next keyframe.
    pub fn reset(&mut self) {
        if !self.ctx.is_null() {
            unsafe { (self.ffmpeg.avcodec_flush_buffers)(self.ctx) };
        }
        self.sps.clear();
        self.pps.clear();
        self.ready = false;
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
        self.ready = false;
        self.sps.clear();
        self.pps.clear();
        self.width = 0;
        self.height = 0;
        self.src_format = -1;
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encoder::{EncoderConfig, VideoEncoder};
    use crate::codec::EncodedFrame;
    use std::sync::mpsc;

    fn encode_frames(count: usize) -> Option<Vec<EncodedFrame>> {
        let mut encoder = VideoEncoder::new().ok()?;
        let (tx, rx) = mpsc::channel();
        encoder.set_on_encoded_frame(Box::new(move |f| tx.send(f).unwrap()));
        encoder
            .configure(EncoderConfig {
                width: 64,
                height: 64,
                bitrate: 500_000,
                fps: 30,
                keyframe_interval: 30,
                input_format: PixelFormat::Bgra,
                ..EncoderConfig::default()
            })
            .ok()?;

        let frame = vec![0x80u8; 64 * 64 * 4]; // mid gray
        for i in 0..count {
            encoder.encode(&frame, (i as u64) * 333_333).unwrap();
        }
        encoder.flush();
        Some(rx.try_iter().collect())
    }

    #[test]
    fn test_discards_input_until_parameter_sets() {
        let Ok(mut decoder) = VideoDecoder::new() else {
            println!("ffmpeg not available, skipping");
            return;
        };
        let Some(frames) = encode_frames(3) else {
            return;
        };
        decoder.configure(DecoderConfig::default()).unwrap();

        // A delta frame carries no SPS/PPS; it must vanish silently.
        let delta = frames.iter().find(|f| !f.is_keyframe).unwrap();
        decoder.decode(&delta.data, delta.timestamp).unwrap();
        assert!(!decoder.is_ready());
        assert_eq!(decoder.stats_handle().snapshot().frames_decoded, 0);

        // The keyframe brings parameter sets and decodes.
        let key = frames.iter().find(|f| f.is_keyframe).unwrap();
        decoder.decode(&key.data, key.timestamp).unwrap();
        assert!(decoder.is_ready());
    }

    #[test]
    fn test_roundtrip_dimensions_and_full_range() {
        let Ok(mut decoder) = VideoDecoder::new() else {
            println!("ffmpeg not available, skipping");
            return;
        };
        let Some(frames) = encode_frames(5) else {
            return;
        };

        let (tx, rx) = mpsc::channel();
        decoder.set_on_decoded_frame(Box::new(move |f| {
            tx.send((f.width, f.height, f.stride, f.timestamp, f.data.clone()))
                .unwrap();
        }));
        decoder.configure(DecoderConfig::default()).unwrap();

        for frame in &frames {
            decoder.decode(&frame.data, frame.timestamp).unwrap();
        }
        decoder.flush();

        let decoded: Vec<_> = rx.try_iter().collect();
        assert!(!decoded.is_empty());

        let (w, h, stride, _ts, data) = &decoded[0];
        let (w, h, stride) = (*w, *h, *stride);
        assert_eq!((w, h), (64, 64));
        assert_eq!(stride, 64 * 4);
        assert_eq!(data.len(), 64 * 64 * 4);

        // Full-range check: a mid-gray source must come back mid-gray,
        // not lifted toward the 16-235 studio range.
        let center = (32 * 64 + 32) * 4;
        for channel in 0..3 {
            let value = data[center + channel] as i32;
            assert!((value - 0x80).abs() < 24, "channel {} was {}", channel, value);
        }

        // Timestamps are non-decreasing through the decoder.
        let mut last = 0;
        for (_, _, _, ts, _) in &decoded {
            assert!(*ts >= last);
            last = *ts;
        }

        let stats = decoder.stats_handle().snapshot();
        assert_eq!(stats.frames_decoded, decoded.len() as u64);
        assert!(stats.keyframes_decoded >= 1);
        assert_eq!(stats.decode_errors, 0);
    }
}
