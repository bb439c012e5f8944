//! Socket collaborator interface: blocking `recv_from`, non-blocking
//! `send_to`, AF_INET/UDP, configurable send/recv buffer sizes.
//!
//! The concrete socket I/O layer is explicitly out of scope for the core —
//! only this interface is specified. [`UdpSocketImpl`] is the real-world
//! implementation `Node` uses outside of tests; [`channel::mod`](crate::channel)
//! and `connection.rs` never touch it directly.

use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Blocking-receive, non-blocking-send datagram socket.
pub trait DatagramSocket: fmt::Debug + Send + Sync {
    /// Blocks until a datagram arrives, or returns an I/O error (including
    /// `WouldBlock` if the implementation has a read timeout set).
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Never blocks; a full send buffer surfaces as `WouldBlock`.
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    /// Bounds how long a blocking `recv_from` can block, so the receive
    /// thread can periodically check a shutdown flag between datagrams.
    pub recv_timeout: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            send_buffer_size: None,
            recv_buffer_size: None,
            recv_timeout: Some(Duration::from_millis(200)),
        }
    }
}

/// `std::net::UdpSocket` wrapped to satisfy [`DatagramSocket`], with send
/// and receive buffer sizes applied through `socket2` before the socket is
/// handed back as a plain `std::net::UdpSocket`.
#[derive(Debug)]
pub struct UdpSocketImpl {
    inner: UdpSocket,
}

impl UdpSocketImpl {
    pub fn bind(addr: SocketAddr, cfg: SocketConfig) -> io::Result<Self> {
        let domain = if addr.is_ipv6() { socket2::Domain::IPV6 } else { socket2::Domain::IPV4 };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.bind(&addr.into())?;
        if let Some(size) = cfg.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = cfg.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        socket.set_read_timeout(cfg.recv_timeout)?;
        Ok(UdpSocketImpl { inner: socket.into() })
    }

    pub fn ephemeral(cfg: SocketConfig) -> io::Result<Self> {
        Self::bind(SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0), cfg)
    }
}

impl DatagramSocket for UdpSocketImpl {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, addr)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
