//! The datagram transport underneath an endpoint.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Carries whole datagrams to and from peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Receives one datagram into `buf`, returning its length and sender.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, peer).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
