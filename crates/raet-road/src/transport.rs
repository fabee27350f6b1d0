//! Datagram transports a road stack can run over.
//!
//! [`Transport`] mirrors the non-blocking half of `std::net::UdpSocket`:
//! both calls return `ErrorKind::WouldBlock` instead of waiting.
//! [`UdpTransport`] is the production socket; [`MemoryNetwork`] wires any
//! number of in-process endpoints together for tests and lets a test
//! capture, drop, or replay datagrams in flight.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};

/// Non-blocking datagram endpoint.
pub trait Transport: Send {
    /// Address this endpoint is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Receive one datagram, or `WouldBlock` when none is waiting.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram, or `WouldBlock` when the endpoint is full.
    fn send_to(&mut self, data: &[u8], to: SocketAddr) -> io::Result<usize>;
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// Non-blocking UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
}

impl UdpTransport {
    /// Bind to `ha` and switch the socket to non-blocking mode.
    pub fn bind(ha: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(ha)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Self { socket, local })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn send_to(&mut self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, to)
    }
}

// ---------------------------------------------------------------------------
// In-memory network
// ---------------------------------------------------------------------------

type Datagram = (SocketAddr, Vec<u8>);

#[derive(Debug, Default)]
struct Fabric {
    queues: HashMap<SocketAddr, VecDeque<Datagram>>,
    blocked: HashMap<SocketAddr, bool>,
}

/// A lossless in-process datagram network. Clones share the same fabric.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl MemoryNetwork {
    /// Create a new empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach an endpoint at `ha`.
    pub fn bind(&self, ha: SocketAddr) -> MemoryTransport {
        self.lock().queues.entry(ha).or_default();
        MemoryTransport {
            network: self.clone(),
            local: ha,
        }
    }

    /// Take every datagram waiting for `ha` (they are not delivered).
    pub fn capture(&self, ha: SocketAddr) -> Vec<Datagram> {
        self.lock()
            .queues
            .get_mut(&ha)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Deliver a datagram to `to` as if `from` had sent it.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: Vec<u8>) {
        if let Some(queue) = self.lock().queues.get_mut(&to) {
            queue.push_back((from, data));
        }
    }

    /// Number of datagrams waiting for `ha`.
    pub fn pending(&self, ha: SocketAddr) -> usize {
        self.lock().queues.get(&ha).map_or(0, VecDeque::len)
    }

    /// While blocked, sends from `ha` fail with `WouldBlock`.
    pub fn set_blocked(&self, ha: SocketAddr, blocked: bool) {
        self.lock().blocked.insert(ha, blocked);
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: SocketAddr,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut fabric = self.network.lock();
        let (from, data) = fabric
            .queues
            .get_mut(&self.local)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| io::Error::from(ErrorKind::WouldBlock))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }

    fn send_to(&mut self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        let mut fabric = self.network.lock();
        if fabric.blocked.get(&self.local).copied().unwrap_or(false) {
            return Err(ErrorKind::WouldBlock.into());
        }
        // unknown destinations swallow the datagram, like UDP
        if let Some(queue) = fabric.queues.get_mut(&to) {
            queue.push_back((self.local, data.to_vec()));
        }
        Ok(data.len())
    }
}
