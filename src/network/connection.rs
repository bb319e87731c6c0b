//! Connection bookkeeping for the server
//!
//! Manages the live connection table:
//! - One record per open transport, keyed by remote address
//! - Idle time accounting between inbound chunks
//! - Close events applied synchronously by the owning loop

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Write side of an accepted connection
pub trait Transport {
    /// Non-blocking write; `WouldBlock` when the socket cannot take more
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

/// Distinguishes successive connections from the same address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Notifications from a connection's reader, delivered to the server loop
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Bytes arrived from the peer
    Data {
        id: ConnectionId,
        addr: SocketAddr,
        len: usize,
    },
    /// The transport reported closed
    Closed {
        id: ConnectionId,
        addr: SocketAddr,
        reason: String,
    },
}

/// One remote endpoint
#[derive(Debug)]
pub struct ConnectionRecord<T> {
    id: ConnectionId,
    addr: SocketAddr,
    transport: T,
    /// Time since the peer last sent anything
    idle: Duration,
}

impl<T: Transport> ConnectionRecord<T> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Inbound data seen
    pub fn touch(&mut self) {
        self.idle = Duration::ZERO;
    }

    pub fn age(&mut self, elapsed: Duration) {
        self.idle += elapsed;
    }

    /// Fire-and-forget write of `bytes`
    pub fn try_send(&self, bytes: &[u8]) -> io::Result<usize> {
        self.transport.try_write(bytes)
    }
}

/// Live connections keyed by remote address
///
/// An address is present only while its transport is open. Records are
/// inserted on accept and removed by the matching close event.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    records: HashMap<SocketAddr, ConnectionRecord<T>>,
    next_id: u64,
}

impl<T: Transport> ConnectionTable<T> {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            next_id: 0,
        }
    }

    /// Reserve the id for a connection about to be inserted
    pub fn next_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: ConnectionId, addr: SocketAddr, transport: T) {
        let record = ConnectionRecord {
            id,
            addr,
            transport,
            idle: Duration::ZERO,
        };

        if let Some(stale) = self.records.insert(addr, record) {
            tracing::warn!(
                "Connection {} from {} replaced by {}",
                stale.id,
                addr,
                id
            );
        }
    }

    /// Remove `addr` if it still belongs to connection `id`
    pub fn remove(&mut self, addr: &SocketAddr, id: ConnectionId) -> Option<ConnectionRecord<T>> {
        match self.records.get(addr) {
            Some(record) if record.id == id => self.records.remove(addr),
            _ => None,
        }
    }

    /// Apply a reader notification
    pub fn apply(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Data { id, addr, len } => {
                if let Some(record) = self.records.get_mut(&addr).filter(|r| r.id == id) {
                    tracing::trace!("{} bytes from {}", len, addr);
                    record.touch();
                }
            }
            ConnectionEvent::Closed { id, addr, reason } => {
                if self.remove(&addr, id).is_some() {
                    tracing::info!("Connection {} closed: {} ({} open)", addr, reason, self.len());
                }
            }
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&ConnectionRecord<T>> {
        self.records.get(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.records.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord<T>> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionRecord<T>> {
        self.records.values_mut()
    }

    /// Drop every record, closing the transports
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl<T: Transport> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
