//! Fire-and-forget UDP notifications for client admissions.
//!
//! Each send opens a fresh datagram socket, enables broadcast transmission,
//! and transmits the payload once. No acknowledgment, no delivery guarantee;
//! the network may silently drop the datagram.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Sender for admission notifications.
///
/// Only the target address persists across calls; the socket itself is
/// scoped to a single `send`.
#[derive(Debug, Clone, Copy)]
pub struct Broadcaster {
    target: SocketAddr,
}

impl Broadcaster {
    /// Create a broadcaster aimed at the given destination.
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }

    /// Destination address the notifications are sent to.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Transmit one datagram carrying the whole payload.
    ///
    /// Returns the number of bytes sent.
    pub fn send(&self, payload: &[u8]) -> io::Result<usize> {
        let bind_addr: SocketAddr = match self.target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_broadcast(true)?;
        socket.send_to(payload, self.target)
    }
}
