//! Datagram transport abstraction
//!
//! The session only needs to send datagrams to an address and to be told
//! about datagrams that arrive. Real sockets and the in-memory network both
//! sit behind these traits.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::NetworkError;

/// Receives datagrams arriving on a bound transport
pub trait DatagramHandler: Send + Sync {
    fn datagram_received(&self, origin: SocketAddr, data: Bytes);
}

impl<F> DatagramHandler for F
where
    F: Fn(SocketAddr, Bytes) + Send + Sync,
{
    fn datagram_received(&self, origin: SocketAddr, data: Bytes) {
        self(origin, data)
    }
}

/// A bound datagram endpoint
pub trait Transport: Send + Sync {
    /// Send one datagram
    fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, NetworkError>;

    /// Address actually bound (port 0 resolves to the assigned port)
    fn local_addr(&self) -> SocketAddr;

    /// Stop receiving and release the endpoint. Idempotent.
    fn close(&self);
}

/// Binds transports; one per RTP and RTCP channel
pub trait TransportFactory: Send + Sync {
    fn bind(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Arc<dyn Transport>, NetworkError>;
}
