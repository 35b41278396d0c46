//! Low-level UDP socket handling
//!
//! One socket per channel with a dedicated receive thread. Non-blocking
//! mode polls with adaptive backoff; blocking mode waits on a read timeout
//! so the thread still notices `close()`.

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{DatagramHandler, Transport, TransportFactory};
use crate::config::TransportConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;

/// Read timeout for blocking receive threads
const BLOCKING_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Create a configured UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr, config: &TransportConfig) -> Result<StdUdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    configure_socket(&socket, config)?;

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    let std_socket: StdUdpSocket = socket.into();
    if config.use_nio {
        std_socket
            .set_nonblocking(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    } else {
        std_socket
            .set_read_timeout(Some(BLOCKING_READ_TIMEOUT))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    }

    Ok(std_socket)
}

fn configure_socket(socket: &Socket, config: &TransportConfig) -> Result<(), NetworkError> {
    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    }

    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set send buffer: {}", e)))?;

    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set recv buffer: {}", e)))?;

    Ok(())
}

/// UDP transport with its own receive thread
pub struct UdpTransport {
    socket: Arc<StdUdpSocket>,

    local_addr: SocketAddr,

    /// Receiver thread handle
    thread_handle: Mutex<Option<JoinHandle<()>>>,

    /// Running flag
    running: Arc<AtomicBool>,

    /// Packets sent counter
    packets_sent: AtomicU64,

    /// Bytes sent counter
    bytes_sent: AtomicU64,

    /// Packets received counter
    packets_received: Arc<AtomicU64>,
}

impl UdpTransport {
    /// Bind and start receiving into `handler`
    pub fn bind(
        addr: SocketAddr,
        config: &TransportConfig,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Self, NetworkError> {
        let socket = Arc::new(create_socket(addr, config)?);
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let packets_received = Arc::new(AtomicU64::new(0));

        let thread_socket = socket.clone();
        let thread_running = running.clone();
        let thread_received = packets_received.clone();
        let non_blocking = config.use_nio;

        let handle = thread::Builder::new()
            .name(format!("rtp-recv-{}", local_addr.port()))
            .spawn(move || {
                let mut recv_buffer = vec![0u8; MAX_DATAGRAM_SIZE];

                // Adaptive backoff for empty reads
                let mut empty_reads = 0u32;
                const MAX_EMPTY_READS: u32 = 100;

                while thread_running.load(Ordering::Relaxed) {
                    match thread_socket.recv_from(&mut recv_buffer) {
                        Ok((size, origin)) => {
                            empty_reads = 0;
                            thread_received.fetch_add(1, Ordering::Relaxed);
                            let data = Bytes::copy_from_slice(&recv_buffer[..size]);
                            handler.datagram_received(origin, data);
                        }
                        Err(ref e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::TimedOut =>
                        {
                            if !non_blocking {
                                continue;
                            }
                            empty_reads = empty_reads.saturating_add(1);

                            if empty_reads < 10 {
                                std::hint::spin_loop();
                            } else if empty_reads < MAX_EMPTY_READS {
                                thread::yield_now();
                            } else {
                                thread::sleep(Duration::from_micros(50));
                            }
                        }
                        Err(e) => {
                            if e.kind() != io::ErrorKind::Interrupted {
                                tracing::warn!("Receive error: {}", e);
                            }
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                }
                tracing::trace!("Receive thread for {} stopped", local_addr);
            })
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

        Ok(Self {
            socket,
            local_addr,
            thread_handle: Mutex::new(Some(handle)),
            running,
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received,
        })
    }

    /// Get packets sent count
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Get bytes sent count
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Get packets received count
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, NetworkError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(NetworkError::NotBound);
        }
        let sent = self
            .socket
            .send_to(data, target)
            .map_err(|e| NetworkError::SendFailed(format!("{}: {}", target, e)))?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.lock().take() {
            // close() may run on the receive thread itself when a handler
            // tears the session down
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("UDP receive thread for {} panicked", self.local_addr);
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Binds socket2-backed UDP transports
#[derive(Debug, Clone, Default)]
pub struct UdpTransportFactory {
    config: TransportConfig,
}

impl UdpTransportFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for UdpTransportFactory {
    fn bind(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Arc<dyn Transport>, NetworkError> {
        let transport = UdpTransport::bind(addr, &self.config, handler)?;
        tracing::debug!("Bound UDP transport on {}", transport.local_addr());
        Ok(Arc::new(transport))
    }
}
