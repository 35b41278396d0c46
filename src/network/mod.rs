//! Network layer: datagram transports for the RTP and RTCP channels

mod memory;
mod transport;
mod udp;

pub use memory::{Datagram, MemoryNetwork, MemoryTransport, PumpHandle};
pub use transport::{DatagramHandler, Transport, TransportFactory};
pub use udp::{create_socket, UdpTransport, UdpTransportFactory};
