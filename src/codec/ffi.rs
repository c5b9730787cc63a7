//! Runtime-loaded FFmpeg bindings (avcodec, avutil, swscale).
//!
//! The libraries are opened with `libloading` on first use, so the crate
//! builds and the protocol/transport tests run on machines without
//! FFmpeg installed. Struct types stay opaque; the handful of fields the
//! encoder and decoder must touch are mirrored as `#[repr(C)]` prefix
//! structs below. The mirrors match avcodec major 61 and 62 (FFmpeg 7/8)
//! and `load()` refuses any other major, so a layout mismatch cannot be
//! dereferenced.

#![allow(non_snake_case)]
#![allow(dead_code)]

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};

use libloading::Library;
use once_cell::sync::OnceCell;

/// Accepted avcodec major versions (FFmpeg 7.x and 8.x).
const SUPPORTED_AVCODEC_MAJORS: [u32; 2] = [61, 62];

// ============================================================================
// Opaque FFmpeg types
// ============================================================================

#[repr(C)]
pub struct AVCodec {
    _private: [u8; 0],
}

#[repr(C)]
pub struct AVCodecContext {
    _private: [u8; 0],
}

#[repr(C)]
pub struct AVFrame {
    _private: [u8; 0],
}

#[repr(C)]
pub struct AVPacket {
    _private: [u8; 0],
}

#[repr(C)]
pub struct AVDictionary {
    _private: [u8; 0],
}

#[repr(C)]
pub struct SwsContext {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AVRational {
    pub num: c_int,
    pub den: c_int,
}

// ============================================================================
// Field mirrors
//
// Prefixes of the real structs, used only to read/write the leading
// fields. Valid for avcodec 61/62, avutil 59/60 (the deprecated
// ticks_per_frame and key_frame fields are gone at those majors).
// ============================================================================

/// Leading fields of `AVCodecContext`.
#[repr(C)]
pub struct AVCodecContextFields {
    pub av_class: *const c_void,
    pub log_level_offset: c_int,
    pub codec_type: c_int,
    pub codec: *const AVCodec,
    pub codec_id: c_int,
    pub codec_tag: c_uint,
    pub priv_data: *mut c_void,
    pub internal: *mut c_void,
    pub opaque: *mut c_void,
    pub bit_rate: i64,
    pub flags: c_int,
    pub flags2: c_int,
    pub extradata: *mut u8,
    pub extradata_size: c_int,
    pub time_base: AVRational,
    pub pkt_timebase: AVRational,
    pub framerate: AVRational,
    pub delay: c_int,
    pub width: c_int,
    pub height: c_int,
    pub coded_width: c_int,
    pub coded_height: c_int,
    pub sample_aspect_ratio: AVRational,
    pub pix_fmt: c_int,
    pub sw_pix_fmt: c_int,
    pub color_primaries: c_int,
    pub color_trc: c_int,
    pub colorspace: c_int,
    pub color_range: c_int,
}

/// Leading fields of `AVFrame`.
#[repr(C)]
pub struct AVFrameFields {
    pub data: [*mut u8; 8],
    pub linesize: [c_int; 8],
    pub extended_data: *mut *mut u8,
    pub width: c_int,
    pub height: c_int,
    pub nb_samples: c_int,
    pub format: c_int,
    pub pict_type: c_int,
    pub sample_aspect_ratio: AVRational,
    pub pts: i64,
    pub pkt_dts: i64,
    pub time_base: AVRational,
}

/// Leading fields of `AVPacket`.
#[repr(C)]
pub struct AVPacketFields {
    pub buf: *mut c_void,
    pub pts: i64,
    pub dts: i64,
    pub data: *mut u8,
    pub size: c_int,
    pub stream_index: c_int,
    pub flags: c_int,
    pub side_data: *mut c_void,
    pub side_data_elems: c_int,
    pub duration: i64,
    pub pos: i64,
}

// ============================================================================
// Constants
// ============================================================================

pub const AV_CODEC_ID_H264: c_int = 27;

pub const AV_PIX_FMT_YUV420P: c_int = 0;
pub const AV_PIX_FMT_UYVY422: c_int = 15;
pub const AV_PIX_FMT_NV12: c_int = 23;
pub const AV_PIX_FMT_RGBA: c_int = 26;
pub const AV_PIX_FMT_BGRA: c_int = 28;

pub const AV_PICTURE_TYPE_NONE: c_int = 0;
pub const AV_PICTURE_TYPE_I: c_int = 1;

pub const AV_PKT_FLAG_KEY: c_int = 1;

pub const AV_CODEC_FLAG_LOW_DELAY: c_int = 1 << 19;
pub const AV_CODEC_FLAG_GLOBAL_HEADER: c_int = 1 << 22;
pub const AV_CODEC_FLAG2_FAST: c_int = 1 << 0;

pub const AVCOL_RANGE_JPEG: c_int = 2;
pub const AVCOL_SPC_BT709: c_int = 1;
pub const AVCOL_PRI_BT709: c_int = 1;
pub const AVCOL_TRC_BT709: c_int = 1;

pub const SWS_FAST_BILINEAR: c_int = 1;
pub const SWS_CS_ITU709: c_int = 1;

pub const AV_LOG_ERROR: c_int = 16;

/// `AVERROR(EAGAIN)` on Linux/Windows.
pub const AVERROR_EAGAIN: c_int = -11;
/// `FFERRTAG('E','O','F',' ')`.
pub const AVERROR_EOF: c_int = -0x2046_4F45;

// ============================================================================
// Function signatures
// ============================================================================

type AvcodecVersionFn = unsafe extern "C" fn() -> c_uint;
type FindEncoderByNameFn = unsafe extern "C" fn(*const c_char) -> *const AVCodec;
type FindCodecFn = unsafe extern "C" fn(c_int) -> *const AVCodec;
type AllocContextFn = unsafe extern "C" fn(*const AVCodec) -> *mut AVCodecContext;
type FreeContextFn = unsafe extern "C" fn(*mut *mut AVCodecContext);
type Open2Fn =
    unsafe extern "C" fn(*mut AVCodecContext, *const AVCodec, *mut *mut AVDictionary) -> c_int;
type SendFrameFn = unsafe extern "C" fn(*mut AVCodecContext, *const AVFrame) -> c_int;
type ReceivePacketFn = unsafe extern "C" fn(*mut AVCodecContext, *mut AVPacket) -> c_int;
type SendPacketFn = unsafe extern "C" fn(*mut AVCodecContext, *const AVPacket) -> c_int;
type ReceiveFrameFn = unsafe extern "C" fn(*mut AVCodecContext, *mut AVFrame) -> c_int;
type FlushBuffersFn = unsafe extern "C" fn(*mut AVCodecContext);
type PacketAllocFn = unsafe extern "C" fn() -> *mut AVPacket;
type PacketFreeFn = unsafe extern "C" fn(*mut *mut AVPacket);
type PacketUnrefFn = unsafe extern "C" fn(*mut AVPacket);
type FrameAllocFn = unsafe extern "C" fn() -> *mut AVFrame;
type FrameFreeFn = unsafe extern "C" fn(*mut *mut AVFrame);
type FrameUnrefFn = unsafe extern "C" fn(*mut AVFrame);
type FrameGetBufferFn = unsafe extern "C" fn(*mut AVFrame, c_int) -> c_int;
type FrameMakeWritableFn = unsafe extern "C" fn(*mut AVFrame) -> c_int;
type StrerrorFn = unsafe extern "C" fn(c_int, *mut c_char, usize) -> c_int;
type DictSetFn =
    unsafe extern "C" fn(*mut *mut AVDictionary, *const c_char, *const c_char, c_int) -> c_int;
type DictFreeFn = unsafe extern "C" fn(*mut *mut AVDictionary);
type LogSetLevelFn = unsafe extern "C" fn(c_int);
type SwsGetContextFn = unsafe extern "C" fn(
    c_int,
    c_int,
    c_int,
    c_int,
    c_int,
    c_int,
    c_int,
    *mut c_void,
    *mut c_void,
    *const f64,
) -> *mut SwsContext;
type SwsScaleFn = unsafe extern "C" fn(
    *mut SwsContext,
    *const *const u8,
    *const c_int,
    c_int,
    c_int,
    *const *mut u8,
    *const c_int,
) -> c_int;
type SwsFreeContextFn = unsafe extern "C" fn(*mut SwsContext);
type SwsGetCoefficientsFn = unsafe extern "C" fn(c_int) -> *const c_int;
type SwsSetColorspaceDetailsFn = unsafe extern "C" fn(
    *mut SwsContext,
    *const c_int,
    c_int,
    *const c_int,
    c_int,
    c_int,
    c_int,
    c_int,
) -> c_int;

// ============================================================================
// Library wrapper
// ============================================================================

/// Loaded FFmpeg entry points. The `Library` handles keep the shared
/// objects mapped for the process lifetime.
pub struct Ffmpeg {
    _avcodec: Library,
    _avutil: Library,
    _swscale: Library,

    pub avcodec_version: AvcodecVersionFn,
    pub avcodec_find_encoder_by_name: FindEncoderByNameFn,
    pub avcodec_find_encoder: FindCodecFn,
    pub avcodec_find_decoder: FindCodecFn,
    pub avcodec_alloc_context3: AllocContextFn,
    pub avcodec_free_context: FreeContextFn,
    pub avcodec_open2: Open2Fn,
    pub avcodec_send_frame: SendFrameFn,
    pub avcodec_receive_packet: ReceivePacketFn,
    pub avcodec_send_packet: SendPacketFn,
    pub avcodec_receive_frame: ReceiveFrameFn,
    pub avcodec_flush_buffers: FlushBuffersFn,
    pub av_packet_alloc: PacketAllocFn,
    pub av_packet_free: PacketFreeFn,
    pub av_packet_unref: PacketUnrefFn,

    pub av_frame_alloc: FrameAllocFn,
    pub av_frame_free: FrameFreeFn,
    pub av_frame_unref: FrameUnrefFn,
    pub av_frame_get_buffer: FrameGetBufferFn,
    pub av_frame_make_writable: FrameMakeWritableFn,
    pub av_strerror: StrerrorFn,
    pub av_dict_set: DictSetFn,
    pub av_dict_free: DictFreeFn,
    pub av_log_set_level: LogSetLevelFn,

    pub sws_getContext: SwsGetContextFn,
    pub sws_scale: SwsScaleFn,
    pub sws_freeContext: SwsFreeContextFn,
    pub sws_getCoefficients: SwsGetCoefficientsFn,
    pub sws_setColorspaceDetails: SwsSetColorspaceDetailsFn,
}

unsafe impl Send for Ffmpeg {}
unsafe impl Sync for Ffmpeg {}

#[cfg(target_os = "windows")]
const AVCODEC_NAMES: &[&str] = &["avcodec-62.dll", "avcodec-61.dll"];
#[cfg(target_os = "windows")]
const AVUTIL_NAMES: &[&str] = &["avutil-60.dll", "avutil-59.dll"];
#[cfg(target_os = "windows")]
const SWSCALE_NAMES: &[&str] = &["swscale-9.dll", "swscale-8.dll"];

#[cfg(target_os = "macos")]
const AVCODEC_NAMES: &[&str] = &[
    "libavcodec.62.dylib",
    "libavcodec.61.dylib",
    "libavcodec.dylib",
];
#[cfg(target_os = "macos")]
const AVUTIL_NAMES: &[&str] = &[
    "libavutil.60.dylib",
    "libavutil.59.dylib",
    "libavutil.dylib",
];
#[cfg(target_os = "macos")]
const SWSCALE_NAMES: &[&str] = &[
    "libswscale.9.dylib",
    "libswscale.8.dylib",
    "libswscale.dylib",
];

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const AVCODEC_NAMES: &[&str] = &["libavcodec.so.62", "libavcodec.so.61", "libavcodec.so"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const AVUTIL_NAMES: &[&str] = &["libavutil.so.60", "libavutil.so.59", "libavutil.so"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const SWSCALE_NAMES: &[&str] = &["libswscale.so.9", "libswscale.so.8", "libswscale.so"];

fn open_first(names: &[&str]) -> Result<Library, String> {
    let mut last_error = String::new();
    for name in names {
        match unsafe { Library::new(name) } {
            Ok(lib) => return Ok(lib),
            Err(e) => last_error = format!("{}: {}", name, e),
        }
    }
    Err(last_error)
}

fn sym<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, String> {
    unsafe {
        lib.get::<T>(name)
            .map(|s| *s)
            .map_err(|e| format!("{}: {}", String::from_utf8_lossy(&name[..name.len() - 1]), e))
    }
}

fn load_libraries() -> Result<Ffmpeg, String> {
    let avcodec = open_first(AVCODEC_NAMES)?;
    let avutil = open_first(AVUTIL_NAMES)?;
    let swscale = open_first(SWSCALE_NAMES)?;

    let ffmpeg = Ffmpeg {
        avcodec_version: sym(&avcodec, b"avcodec_version\0")?,
        avcodec_find_encoder_by_name: sym(&avcodec, b"avcodec_find_encoder_by_name\0")?,
        avcodec_find_encoder: sym(&avcodec, b"avcodec_find_encoder\0")?,
        avcodec_find_decoder: sym(&avcodec, b"avcodec_find_decoder\0")?,
        avcodec_alloc_context3: sym(&avcodec, b"avcodec_alloc_context3\0")?,
        avcodec_free_context: sym(&avcodec, b"avcodec_free_context\0")?,
        avcodec_open2: sym(&avcodec, b"avcodec_open2\0")?,
        avcodec_send_frame: sym(&avcodec, b"avcodec_send_frame\0")?,
        avcodec_receive_packet: sym(&avcodec, b"avcodec_receive_packet\0")?,
        avcodec_send_packet: sym(&avcodec, b"avcodec_send_packet\0")?,
        avcodec_receive_frame: sym(&avcodec, b"avcodec_receive_frame\0")?,
        avcodec_flush_buffers: sym(&avcodec, b"avcodec_flush_buffers\0")?,
        av_packet_alloc: sym(&avcodec, b"av_packet_alloc\0")?,
        av_packet_free: sym(&avcodec, b"av_packet_free\0")?,
        av_packet_unref: sym(&avcodec, b"av_packet_unref\0")?,

        av_frame_alloc: sym(&avutil, b"av_frame_alloc\0")?,
        av_frame_free: sym(&avutil, b"av_frame_free\0")?,
        av_frame_unref: sym(&avutil, b"av_frame_unref\0")?,
        av_frame_get_buffer: sym(&avutil, b"av_frame_get_buffer\0")?,
        av_frame_make_writable: sym(&avutil, b"av_frame_make_writable\0")?,
        av_strerror: sym(&avutil, b"av_strerror\0")?,
        av_dict_set: sym(&avutil, b"av_dict_set\0")?,
        av_dict_free: sym(&avutil, b"av_dict_free\0")?,
        av_log_set_level: sym(&avutil, b"av_log_set_level\0")?,

        sws_getContext: sym(&swscale, b"sws_getContext\0")?,
        sws_scale: sym(&swscale, b"sws_scale\0")?,
        sws_freeContext: sym(&swscale, b"sws_freeContext\0")?,
        sws_getCoefficients: sym(&swscale, b"sws_getCoefficients\0")?,
        sws_setColorspaceDetails: sym(&swscale, b"sws_setColorspaceDetails\0")?,

        _avcodec: avcodec,
        _avutil: avutil,
        _swscale: swscale,
    };

    let version = unsafe { (ffmpeg.avcodec_version)() };
    let major = version >> 16;
    if !SUPPORTED_AVCODEC_MAJORS.contains(&major) {
        return Err(format!(
            "avcodec major {} not supported (need one of {:?})",
            major, SUPPORTED_AVCODEC_MAJORS
        ));
    }

    // Keep avcodec quiet unless something is actually wrong; our own
    // logging reports per-frame errors.
    unsafe { (ffmpeg.av_log_set_level)(AV_LOG_ERROR) };

    log::info!(
        "ffmpeg loaded (avcodec {}.{}.{})",
        major,
        (version >> 8) & 0xFF,
        version & 0xFF
    );

    Ok(ffmpeg)
}

static FFMPEG: OnceCell<Result<Ffmpeg, String>> = OnceCell::new();

/// Load FFmpeg on first call; later calls are free.
pub fn load() -> Result<&'static Ffmpeg, String> {
    match FFMPEG.get_or_init(load_libraries) {
        Ok(ffmpeg) => Ok(ffmpeg),
        Err(e) => Err(e.clone()),
    }
}

/// True when the FFmpeg libraries could be loaded on this machine.
pub fn is_available() -> bool {
    load().is_ok()
}

/// Human-readable message for an FFmpeg error code.
pub fn error_string(ffmpeg: &Ffmpeg, code: c_int) -> String {
    let mut buf = [0 as c_char; 256];
    unsafe {
        if (ffmpeg.av_strerror)(code, buf.as_mut_ptr(), buf.len()) < 0 {
            return format!("ffmpeg error {}", code);
        }
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_probe() {
        // Loads when FFmpeg is installed, reports cleanly when not.
        println!("ffmpeg available: {}", is_available());
    }

    #[test]
    fn test_error_string_when_available() {
        if let Ok(ffmpeg) = load() {
            let msg = error_string(ffmpeg, AVERROR_EAGAIN);
            assert!(!msg.is_empty());
        }
    }
}
