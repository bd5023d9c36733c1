//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] on the send side and hands raw datagrams back on
//! the receive side (each endpoint decides when and whether to decode).  All
//! protocol logic lives elsewhere; this module owns only byte I/O.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    Io(io::Error),
    /// The outbound packet could not be encoded.
    Packet(PacketError),
}

impl SocketError {
    /// I/O error kind, if this is an OS-level failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            Self::Packet(_) => None,
        }
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "socket I/O error: {e}"),
            Self::Packet(e) => write!(f, "packet encode error: {e}"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PacketError> for SocketError {
    fn from(e: PacketError) -> Self {
        Self::Packet(e)
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, packet-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks behind an
/// `Arc`.  The OS socket is closed when the last reference is dropped.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new listening socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Open a socket connected to `remote`.
    ///
    /// Binds an ephemeral port of the same address family.  A connected UDP
    /// socket surfaces ICMP port-unreachable as `ConnectionRefused` on the
    /// next read.
    pub async fn connect(remote: SocketAddr) -> Result<Self, SocketError> {
        let any = match remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let inner = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
        inner.connect(remote).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Write an already-encoded datagram to the connected peer.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), SocketError> {
        self.inner.send(bytes).await?;
        Ok(())
    }

    /// Encode `packet` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = packet.encode()?;
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram, waiting at most `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes without a datagram; that
    /// is a liveness tick, not a failure.  Datagrams longer than
    /// `buf_size` are truncated by the OS.
    pub async fn recv_timeout(
        &self,
        buf_size: usize,
        deadline: Duration,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>, SocketError> {
        let mut buf = vec![0u8; buf_size];
        match tokio::time::timeout(deadline, self.inner.recv_from(&mut buf)).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((n, addr))) => {
                buf.truncate(n);
                Ok(Some((buf, addr)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn recv_timeout_returns_none_when_idle() {
        let socket = Socket::bind(loopback()).await.unwrap();
        let got = socket
            .recv_timeout(1024, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn connected_send_reaches_listener() {
        let listener = Socket::bind(loopback()).await.unwrap();
        let client = Socket::connect(listener.local_addr).await.unwrap();

        client.send(b"ping").await.unwrap();
        let (bytes, from) = listener
            .recv_timeout(1024, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("datagram");
        assert_eq!(bytes, b"ping");
        // The client is bound to the unspecified address; only the port is comparable.
        assert_eq!(from.port(), client.local_addr.port());
    }

    #[tokio::test]
    async fn send_to_encodes_packet() {
        let listener = Socket::bind(loopback()).await.unwrap();
        let client = Socket::bind(loopback()).await.unwrap();

        let pkt = Packet::new(3, 0, flags::ACK, b"");
        client.send_to(&pkt, listener.local_addr).await.unwrap();

        let (bytes, _) = listener
            .recv_timeout(1024, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("datagram");
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }
}
