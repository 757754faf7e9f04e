//! TCP connection table: routes inbound segments by 4-tuple to an existing
//! connection, or to a listener bound on the destination port.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::endpoint::Endpoint;
use crate::error::NetworkError;

use super::connection::TcpConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local: Endpoint,
    pub remote: Endpoint,
}

pub trait Listener: Send + Sync {
    /// Called when a SYN arrives for `local_port` with no existing
    /// connection; the listener decides whether to spawn one.
    fn on_syn(&self, local: Endpoint, remote: Endpoint, syn: &super::segment::TcpSegment);
}

#[derive(Default)]
struct Inner {
    connections: HashMap<FourTuple, Arc<TcpConnection>>,
    listeners: HashMap<u16, Arc<dyn Listener>>,
    next_ephemeral: u16,
}

pub struct TcpDemux {
    port_range: (u16, u16),
    inner: RwLock<Inner>,
}

impl TcpDemux {
    pub fn new(port_range: (u16, u16)) -> Self {
        TcpDemux {
            port_range,
            inner: RwLock::new(Inner {
                connections: HashMap::new(),
                listeners: HashMap::new(),
                next_ephemeral: port_range.0,
            }),
        }
    }

    pub fn insert(&self, conn: Arc<TcpConnection>) {
        let key = FourTuple {
            local: conn.local,
            remote: conn.remote,
        };
        self.inner.write().unwrap().connections.insert(key, conn);
    }

    pub fn remove(&self, key: &FourTuple) {
        self.inner.write().unwrap().connections.remove(key);
    }

    pub fn lookup(&self, key: &FourTuple) -> Option<Arc<TcpConnection>> {
        self.inner.read().unwrap().connections.get(key).cloned()
    }

    /// Ticks every live connection's retransmit/TIME_WAIT timer, reaping
    /// any that closed as a result. Intended for a background timer thread.
    pub fn tick_all(&self) {
        let snapshot: Vec<(FourTuple, Arc<TcpConnection>)> = {
            let inner = self.inner.read().unwrap();
            inner.connections.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        let mut closed = Vec::new();
        for (key, conn) in snapshot {
            if conn.tick() {
                closed.push(key);
            }
        }
        if !closed.is_empty() {
            let mut inner = self.inner.write().unwrap();
            for key in closed {
                inner.connections.remove(&key);
            }
        }
    }

    pub fn register_listener(&self, port: u16, listener: Arc<dyn Listener>) -> Result<(), NetworkError> {
        let mut inner = self.inner.write().unwrap();
        if inner.listeners.contains_key(&port) {
            return Err(NetworkError::PortInUse);
        }
        inner.listeners.insert(port, listener);
        Ok(())
    }

    pub fn unregister_listener(&self, port: u16) {
        self.inner.write().unwrap().listeners.remove(&port);
    }

    /// Allocates an unused local port from the ephemeral range, by a
    /// rolling scan (does not bind a connection to it — used by
    /// client-side `connect()` before the 4-tuple is known).
    pub fn allocate_ephemeral(&self) -> Result<u16, NetworkError> {
        let mut inner = self.inner.write().unwrap();
        let (lo, hi) = self.port_range;
        let span = (hi - lo) as u32 + 1;
        let start = inner.next_ephemeral;
        let used: std::collections::HashSet<u16> =
            inner.connections.keys().map(|k| k.local.port).collect();
        for i in 0..span {
            let candidate = lo + (((start - lo) as u32 + i) % span) as u16;
            if !used.contains(&candidate) && !inner.listeners.contains_key(&candidate) {
                inner.next_ephemeral = if candidate == hi { lo } else { candidate + 1 };
                return Ok(candidate);
            }
        }
        Err(NetworkError::NoEphemeralPorts)
    }

    /// Routes an inbound segment. Matches an existing connection first;
    /// failing that, a listener on the destination port for a pure SYN;
    /// anything else returns `None`, signaling the caller to send a RST.
    pub fn route(&self, local: Endpoint, remote: Endpoint, seg: &super::segment::TcpSegment) -> Route {
        let key = FourTuple { local, remote };
        if let Some(conn) = self.lookup(&key) {
            return Route::Connection(conn);
        }
        let inner = self.inner.read().unwrap();
        if let Some(listener) = inner.listeners.get(&local.port) {
            return Route::Listener(listener.clone());
        }
        Route::Unknown
    }
}

pub enum Route {
    Connection(Arc<TcpConnection>),
    Listener(Arc<dyn Listener>),
    Unknown,
}
