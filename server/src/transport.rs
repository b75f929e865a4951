//! Datagram write side used by client sessions

use std::io;
use std::net::SocketAddr;

/// Fire-and-forget datagram writer
///
/// Implementations must not block waiting for the socket to become writable;
/// a write that cannot complete immediately is reported as an error and the
/// caller drops it.
pub trait Transport: Send + Sync {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl Transport for tokio::net::UdpSocket {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.try_send_to(data, addr)
    }
}

impl Transport for std::net::UdpSocket {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        std::net::UdpSocket::send_to(self, data, addr)
    }
}
