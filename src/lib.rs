//! ndi-bridge - NDI over WAN.
//!
//! Captures a video-over-IP (NDI) source on one LAN, encodes it to
//! H.264, carries video and audio over a single lossy UDP flow, and
//! republishes the stream as a native NDI source on the far side.
//!
//! The interesting part is the streaming plane:
//! - a 38-byte fragmenting packet protocol ([`protocol`])
//! - the host pipeline: capture, bounded encode queue, encoder,
//!   non-blocking fragmenting sender ([`host`])
//! - the join pipeline: receive loop, per-stream reassembly, bounded
//!   decode queue, decoder, real-time or buffered playout ([`join`])
//!
//! Transport is fire-and-forget: no retransmission, no FEC, no
//! congestion control. Frames that lose a fragment are dropped whole
//! and the stream recovers at the next keyframe.

use thiserror::Error;

pub mod clock;
pub mod codec;
pub mod host;
pub mod join;
pub mod ndi;
pub mod net;
pub mod playout;
pub mod protocol;
pub mod queue;

pub use host::{HostConfig, HostPipeline, HostStats, PipelineState};
pub use join::{JoinConfig, JoinPipeline, JoinStats};
pub use protocol::{PacketHeader, ProtocolError, DEFAULT_MTU};

/// Top-level pipeline errors: anything that prevents a pipeline from
/// starting. Once streaming, transient errors are counted, not raised.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Ndi(#[from] ndi::NdiError),

    #[error(transparent)]
    Net(#[from] net::NetError),

    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    #[error("pipeline already running")]
    AlreadyRunning,
}
