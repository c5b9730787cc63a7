//! UDP transport: socket construction, fragmenting sender, receive loop.

use std::io;

use thiserror::Error;

mod socket;
pub mod receiver;
pub mod sender;

pub use receiver::{PacketProcessor, ReceiverCallbacks, UdpReceiver, UdpReceiverConfig, UdpReceiverStats};
pub use sender::{UdpSender, UdpSenderConfig, UdpSenderStats, UdpSenderStatsHandle};

/// Send socket buffer request: large enough to absorb keyframe bursts.
pub const SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Receive socket buffer request. Kernels may grant less; the granted
/// size is recorded in the receiver stats.
pub const RECV_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Errors raised by the transport layer. Only setup failures are fatal;
/// per-packet errors are counted and the stream keeps going.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to resolve {0}")]
    Resolve(String),

    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] io::Error),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("not connected")]
    NotConnected,

    #[error("receiver already listening")]
    AlreadyListening,
}
