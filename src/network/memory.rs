//! In-process datagram network
//!
//! Transports bound here exchange datagrams through a FIFO queue instead of
//! sockets. Delivery happens only when the queue is pumped, which keeps
//! session tests deterministic.

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{DatagramHandler, Transport, TransportFactory};
use crate::error::NetworkError;

/// First port handed out for binds on port 0
const EPHEMERAL_PORT_START: u16 = 40_000;

/// One datagram in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Bytes,
}

struct Fabric {
    endpoints: DashMap<SocketAddr, Arc<dyn DatagramHandler>>,
    queue_tx: Sender<Datagram>,
    queue_rx: Receiver<Datagram>,
    log: Mutex<Vec<Datagram>>,
    next_port: AtomicU16,
}

impl Fabric {
    fn deliver(&self, datagram: Datagram) -> bool {
        // Clone out of the map so the handler may bind or close endpoints
        let handler = self.endpoints.get(&datagram.to).map(|entry| entry.value().clone());
        match handler {
            Some(handler) => {
                handler.datagram_received(datagram.from, datagram.data);
                true
            }
            None => {
                tracing::trace!("No endpoint at {}, dropping datagram", datagram.to);
                false
            }
        }
    }
}

/// Shared in-memory datagram fabric
#[derive(Clone)]
pub struct MemoryNetwork {
    fabric: Arc<Fabric>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = unbounded();
        Self {
            fabric: Arc::new(Fabric {
                endpoints: DashMap::new(),
                queue_tx,
                queue_rx,
                log: Mutex::new(Vec::new()),
                next_port: AtomicU16::new(EPHEMERAL_PORT_START),
            }),
        }
    }

    /// Deliver queued datagrams until none are left. Datagrams sent by
    /// handlers during delivery are delivered too. Returns the number of
    /// datagrams handed to an endpoint.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while let Ok(datagram) = self.fabric.queue_rx.try_recv() {
            if self.fabric.deliver(datagram) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver continuously on a background thread
    pub fn spawn_pump(&self) -> PumpHandle {
        let fabric = self.fabric.clone();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let handle = thread::Builder::new()
            .name("memory-network-pump".into())
            .spawn(move || {
                while thread_running.load(Ordering::Relaxed) {
                    match fabric.queue_rx.recv_timeout(Duration::from_millis(10)) {
                        Ok(datagram) => {
                            fabric.deliver(datagram);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        match handle {
            Ok(handle) => PumpHandle {
                running,
                handle: Some(handle),
            },
            Err(e) => {
                tracing::error!("Failed to spawn network pump: {}", e);
                PumpHandle {
                    running,
                    handle: None,
                }
            }
        }
    }

    /// Every datagram sent so far, in send order
    pub fn sent_datagrams(&self) -> Vec<Datagram> {
        self.fabric.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.fabric.log.lock().clear();
    }

    /// Number of datagrams waiting for delivery
    pub fn pending(&self) -> usize {
        self.fabric.queue_rx.len()
    }

    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.fabric.endpoints.contains_key(&addr)
    }

    fn assign_port(&self, addr: SocketAddr) -> SocketAddr {
        if addr.port() != 0 {
            return addr;
        }
        let mut resolved = addr;
        loop {
            let port = self.fabric.next_port.fetch_add(1, Ordering::Relaxed);
            resolved.set_port(port);
            if port != 0 && !self.fabric.endpoints.contains_key(&resolved) {
                return resolved;
            }
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MemoryNetwork {
    fn bind(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Arc<dyn Transport>, NetworkError> {
        let local = self.assign_port(addr);
        match self.fabric.endpoints.entry(local) {
            Entry::Occupied(_) => {
                return Err(NetworkError::BindFailed(format!("{}: address already in use", local)))
            }
            Entry::Vacant(slot) => {
                slot.insert(handler);
            }
        }

        Ok(Arc::new(MemoryTransport {
            fabric: self.fabric.clone(),
            local,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    fabric: Arc<Fabric>,
    local: SocketAddr,
    closed: AtomicBool,
}

impl Transport for MemoryTransport {
    fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::NotBound);
        }
        let datagram = Datagram {
            from: self.local,
            to: target,
            data: Bytes::copy_from_slice(data),
        };
        self.fabric.log.lock().push(datagram.clone());
        self.fabric
            .queue_tx
            .send(datagram)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(data.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.fabric.endpoints.remove(&self.local);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background delivery started by [`MemoryNetwork::spawn_pump`]
pub struct PumpHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PumpHandle {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Memory network pump thread panicked");
            }
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
