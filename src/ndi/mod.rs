//! NDI capture and publish.
//!
//! Thin wrappers around the NDI runtime, which is loaded dynamically on
//! first use (the SDK ships as a shared library; linking it at build
//! time would tie the binary to one install location). Capture feeds the
//! host pipeline; output publishes the join pipeline's decoded frames as
//! a new NDI source.

use thiserror::Error;

pub mod capture;
pub(crate) mod ffi;
pub mod output;

pub use capture::{CaptureCallbacks, CaptureConfig, NdiCapture};
pub use output::NdiOutput;

/// Errors from the NDI integration.
#[derive(Error, Debug)]
pub enum NdiError {
    #[error("NDI runtime not available: {0}")]
    Unavailable(String),

    #[error("failed to initialize NDI: {0}")]
    Init(String),

    #[error("failed to create NDI receiver: {0}")]
    ReceiverCreate(String),

    #[error("failed to create NDI sender: {0}")]
    SenderCreate(String),

    #[error("no NDI sources found on the network")]
    NoSources,

    #[error("NDI source '{0}' not found")]
    SourceNotFound(String),

    #[error("capture already running")]
    AlreadyRunning,

    #[error("no source selected")]
    NoSourcePrepared,
}

/// A discovered NDI source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdiSource {
    /// Full NDI name, e.g. `HOSTNAME (Source Name)`.
    pub name: String,
    /// URL address; may be empty.
    pub address: String,
}

/// One captured video frame, copied out of the NDI runtime's buffer.
#[derive(Debug, Clone)]
pub struct CapturedVideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Line stride in bytes.
    pub stride: u32,
    /// FourCC pixel format code as reported by NDI.
    pub fourcc: u32,
    pub frame_rate_n: u32,
    pub frame_rate_d: u32,
    /// Presentation time in 100 ns ticks.
    pub timestamp: i64,
}

/// One captured audio frame: planar 32-bit float samples, channel 0
/// first, matching the on-wire audio layout.
#[derive(Debug, Clone)]
pub struct CapturedAudioFrame {
    pub data: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u8,
    pub samples_per_channel: u32,
    /// Presentation time in 100 ns ticks.
    pub timestamp: i64,
}
