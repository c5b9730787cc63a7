//! UDP socket construction via socket2.
//!
//! std's `UdpSocket` cannot size kernel buffers, so sockets are built
//! through socket2 and converted. Shallow kernel buffers are the main
//! source of burst loss on the send side and of drop storms on the
//! receive side when a keyframe fans out into hundreds of fragments.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::debug;
use socket2::{Domain, Protocol, Socket, Type};

use super::NetError;

/// How long the receive loop blocks before re-checking its stop flag.
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Create a connected, non-blocking UDP socket for sending.
pub fn connect_udp(host: &str, port: u16, send_buffer: usize) -> Result<UdpSocket, NetError> {
    let target = format!("{}:{}", host, port);
    let addr = target
        .to_socket_addrs()
        .map_err(|_| NetError::Resolve(target.clone()))?
        .next()
        .ok_or_else(|| NetError::Resolve(target.clone()))?;

    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(NetError::SocketCreate)?;
    socket.set_reuse_address(true).map_err(NetError::SocketCreate)?;

    // Best effort: the kernel may clamp the request.
    let _ = socket.set_send_buffer_size(send_buffer);

    socket.connect(&addr.into()).map_err(|e| NetError::Connect {
        addr: target.clone(),
        source: e,
    })?;
    socket.set_nonblocking(true).map_err(NetError::SocketCreate)?;

    debug!(
        "udp send socket connected to {} (sndbuf granted {})",
        addr,
        socket.send_buffer_size().unwrap_or(0)
    );

    Ok(socket.into())
}

/// Bind a receive socket on `0.0.0.0:port` with a sized kernel buffer.
///
/// Returns the socket and the buffer size the kernel actually granted.
/// The socket carries a short read timeout so the receive loop can poll
/// its stop flag.
pub fn bind_udp(port: u16, recv_buffer: usize) -> Result<(UdpSocket, usize), NetError> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(NetError::SocketCreate)?;
    socket.set_reuse_address(true).map_err(NetError::SocketCreate)?;

    let _ = socket.set_recv_buffer_size(recv_buffer);
    let granted = socket.recv_buffer_size().unwrap_or(0);

    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .expect("static bind address");
    socket
        .bind(&addr.into())
        .map_err(|e| NetError::Bind { port, source: e })?;

    socket
        .set_read_timeout(Some(RECV_POLL_TIMEOUT))
        .map_err(NetError::SocketCreate)?;

    debug!(
        "udp recv socket bound on port {} (rcvbuf requested {} granted {})",
        port, recv_buffer, granted
    );

    Ok((socket.into(), granted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_connect_loopback() {
        let (recv, granted) = bind_udp(0, 1024 * 1024).unwrap();
        assert!(granted > 0);
        let port = recv.local_addr().unwrap().port();
        assert_ne!(port, 0);

        let send = connect_udp("127.0.0.1", port, 1024 * 1024).unwrap();
        send.send(b"ping").unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = recv.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
    }

    #[test]
    fn test_resolve_failure() {
        let err = connect_udp("this-host-does-not-exist.invalid", 5990, 1024).unwrap_err();
        assert!(matches!(err, NetError::Resolve(_)));
    }
}
