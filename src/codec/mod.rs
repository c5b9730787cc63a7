//! H.264 codec integration.
//!
//! Encoding and decoding go through FFmpeg's avcodec/swscale, loaded at
//! runtime (no compile-time FFmpeg dependency). The pipeline stays
//! usable for protocol work on machines without the libraries; encoder
//! and decoder construction simply fail with [`CodecError::Unavailable`].

use thiserror::Error;

pub mod annexb;
pub mod decoder;
pub mod encoder;
pub(crate) mod ffi;

pub use decoder::{DecoderConfig, DecoderStats, VideoDecoder};
pub use encoder::{EncoderConfig, EncoderStats, VideoEncoder};

/// Raw pixel layouts exchanged with NDI and the codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit BGRA, packed.
    Bgra,
    /// 16-bit packed YUV 4:2:2 (NDI native).
    Uyvy,
    /// Planar YUV 4:2:0, Y plane + interleaved UV.
    Nv12,
    /// Planar YUV 4:2:0, separate Y, U, V planes.
    I420,
}

impl PixelFormat {
    /// Tight stride in bytes for the first plane at a given width.
    pub fn default_stride(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Bgra => width * 4,
            PixelFormat::Uyvy => width * 2,
            PixelFormat::Nv12 | PixelFormat::I420 => width,
        }
    }

    /// Map an NDI FourCC to a pixel format, defaulting to BGRA for the
    /// RGB-family codes.
    pub fn from_fourcc(fourcc: u32) -> Self {
        match fourcc {
            0x5956_5955 | 0x5559_5659 => PixelFormat::Uyvy, // "UYVY" / "YVYU"
            0x3231_564E => PixelFormat::Nv12,               // "NV12"
            0x3032_3449 => PixelFormat::I420,               // "I420"
            _ => PixelFormat::Bgra,
        }
    }
}

/// One encoded H.264 access unit in Annex-B form.
///
/// Keyframes carry SPS and PPS prepended with 4-byte start codes. The
/// frame is owned by the sender stage until every fragment has been
/// handed to the socket.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
    /// Presentation time in 10 MHz ticks.
    pub timestamp: u64,
}

/// One decoded raw frame. The decoder reuses its output buffer across
/// frames; downstream copies or moves what it needs.
#[derive(Debug, Clone, Default)]
pub struct DecodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// First-plane stride in bytes.
    pub stride: u32,
    pub format: Option<PixelFormat>,
    /// Presentation time in 10 MHz ticks.
    pub timestamp: u64,
}

/// Codec failures. Configuration-time errors are fatal to the pipeline;
/// per-frame errors are counted and the stream continues.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("ffmpeg libraries not available: {0}")]
    Unavailable(String),

    #[error("codec not configured")]
    NotConfigured,

    #[error("failed to configure codec: {0}")]
    Configure(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("pixel conversion failed: {0}")]
    Convert(String),
}
