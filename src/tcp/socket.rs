//! Socket-style API over the connection engine: `listen`/`accept`,
//! `connect`, `send`/`recv`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;

use log::warn;

use crate::config::TcpConfig;
use crate::endpoint::Endpoint;
use crate::error::{NetworkError, Result};
use crate::wire::Ipv4Addr;

use super::connection::{SegmentTransmit, TcpConnection, TcpState};
use super::demux::{FourTuple, Listener, Route, TcpDemux};
use super::segment::TcpSegment;

/// Builds the per-connection egress closure: wraps a segment in IPv4,
/// resolves the next hop, and hands it to the link layer. Implemented by
/// the top-level stack, which owns routing/ARP/transport.
pub trait TcpEgress: Send + Sync {
    fn make_transmit(&self, local: Endpoint, remote: Endpoint) -> Arc<dyn SegmentTransmit>;
}

impl<F> TcpEgress for F
where
    F: Fn(Endpoint, Endpoint) -> Arc<dyn SegmentTransmit> + Send + Sync,
{
    fn make_transmit(&self, local: Endpoint, remote: Endpoint) -> Arc<dyn SegmentTransmit> {
        self(local, remote)
    }
}

/// A connected (or connecting) TCP socket.
pub struct TcpSocket {
    connection: Arc<TcpConnection>,
    demux: Arc<TcpDemux>,
}

impl TcpSocket {
    pub(crate) fn from_connection(connection: Arc<TcpConnection>, demux: Arc<TcpDemux>) -> Self {
        TcpSocket { connection, demux }
    }

    /// Client-side active open. Allocates an ephemeral local port if
    /// `local_port` is `None`, then blocks until ESTABLISHED or the
    /// configured connect timeout elapses.
    pub fn connect(
        local_ip: Ipv4Addr,
        local_port: Option<u16>,
        remote: Endpoint,
        demux: Arc<TcpDemux>,
        egress: Arc<dyn TcpEgress>,
        config: TcpConfig,
    ) -> Result<Self> {
        let port = match local_port {
            Some(p) => p,
            None => demux.allocate_ephemeral()?,
        };
        let local = Endpoint::new(local_ip, port);
        let transmit = egress.make_transmit(local, remote);
        let connection = Arc::new(TcpConnection::connect(local, remote, transmit, config));
        demux.insert(connection.clone());
        match connection.wait_established(config.connect_timeout, config.connect_poll_interval) {
            Ok(()) => Ok(TcpSocket { connection, demux }),
            Err(e) => {
                demux.remove(&FourTuple { local, remote });
                Err(e)
            }
        }
    }

    pub fn local_addr(&self) -> Endpoint {
        self.connection.local
    }

    pub fn remote_addr(&self) -> Endpoint {
        self.connection.remote
    }

    pub fn state(&self) -> TcpState {
        self.connection.state()
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.connection.send(data)
    }

    pub fn recv(&self) -> Result<Vec<u8>> {
        self.connection.recv()
    }

    pub fn close(&self) -> Result<()> {
        self.connection.close()
    }

    pub(crate) fn connection(&self) -> &Arc<TcpConnection> {
        &self.connection
    }
}

struct AcceptQueue {
    queue: VecDeque<Arc<TcpConnection>>,
    capacity: usize,
    pending: HashMap<Endpoint, Arc<TcpConnection>>,
}

/// A listening socket. Pending connections are tracked by remote address
/// until their handshake reaches `Established`, at which point `accept()`
/// migrates them into the ready queue.
pub struct TcpListener {
    local: Endpoint,
    demux: Arc<TcpDemux>,
    egress: Arc<dyn TcpEgress>,
    config: TcpConfig,
    accept: Mutex<AcceptQueue>,
}

impl TcpListener {
    pub fn bind(
        local: Endpoint,
        backlog: usize,
        demux: Arc<TcpDemux>,
        egress: Arc<dyn TcpEgress>,
        config: TcpConfig,
    ) -> Result<Arc<Self>> {
        let listener = Arc::new(TcpListener {
            local,
            demux: demux.clone(),
            egress,
            config,
            accept: Mutex::new(AcceptQueue {
                queue: VecDeque::new(),
                capacity: backlog,
                pending: HashMap::new(),
            }),
        });
        demux.register_listener(local.port, listener.clone())?;
        Ok(listener)
    }

    pub fn local_addr(&self) -> Endpoint {
        self.local
    }

    /// Blocks until a connection completes its handshake, returning a
    /// connected socket for it.
    pub fn accept(&self) -> Result<TcpSocket> {
        loop {
            if let Some(conn) = self.migrate_established() {
                return Ok(TcpSocket::from_connection(conn, self.demux.clone()));
            }
            thread::sleep(self.config.connect_poll_interval);
        }
    }

    fn migrate_established(&self) -> Option<Arc<TcpConnection>> {
        let mut q = self.accept.lock().unwrap();
        let ready: Vec<Endpoint> = q
            .pending
            .iter()
            .filter(|(_, c)| c.state() == TcpState::Established)
            .map(|(addr, _)| *addr)
            .collect();
        for remote in ready {
            let conn = q.pending.remove(&remote).unwrap();
            if q.queue.len() >= q.capacity {
                warn!("{}: accept queue full, dropping connection from {}", self.local, remote);
                let _ = conn.close();
                self.demux.remove(&FourTuple {
                    local: self.local,
                    remote,
                });
            } else {
                q.queue.push_back(conn);
            }
        }
        q.queue.pop_front()
    }
}

impl Listener for TcpListener {
    fn on_syn(&self, local: Endpoint, remote: Endpoint, syn: &TcpSegment) {
        let mut q = self.accept.lock().unwrap();
        if q.pending.contains_key(&remote) {
            return;
        }
        let transmit = self.egress.make_transmit(local, remote);
        match TcpConnection::accept_syn(local, remote, transmit, self.config, syn) {
            Ok(conn) => {
                let conn = Arc::new(conn);
                self.demux.insert(conn.clone());
                q.pending.insert(remote, conn);
            }
            Err(e) => warn!("{}: rejecting SYN from {}: {}", self.local, remote, e),
        }
    }
}

/// Dispatches an inbound, checksum-verified segment via the demux: to an
/// existing connection, to a listener (spawning a pending connection), or
/// — if neither matches — returns the RST the caller should send back.
pub fn dispatch(demux: &TcpDemux, local: Endpoint, remote: Endpoint, seg: &TcpSegment) -> Option<TcpSegment> {
    match demux.route(local, remote, seg) {
        Route::Connection(conn) => {
            conn.handle_segment(seg);
            if conn.state() == TcpState::Closed {
                demux.remove(&FourTuple { local, remote });
            }
            None
        }
        Route::Listener(listener) => {
            if seg.flags.contains(super::segment::TcpFlags::SYN)
                && !seg.flags.contains(super::segment::TcpFlags::ACK)
            {
                listener.on_syn(local, remote, seg);
                None
            } else {
                Some(super::connection::reset_for(local.port, remote.port, seg))
            }
        }
        Route::Unknown => {
            if seg.flags.contains(super::segment::TcpFlags::RST) {
                None
            } else {
                Some(super::connection::reset_for(local.port, remote.port, seg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::segment::TcpFlags;
    use std::sync::Mutex as StdMutex;

    fn ep(octet: u8, port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new([10, 0, 0, octet]), port)
    }

    fn egress_capturing(store: Arc<StdMutex<Vec<TcpSegment>>>) -> Arc<dyn TcpEgress> {
        Arc::new(move |_local: Endpoint, _remote: Endpoint| -> Arc<dyn SegmentTransmit> {
            let store = store.clone();
            Arc::new(move |seg: TcpSegment| {
                store.lock().unwrap().push(seg);
            })
        })
    }

    #[test]
    fn listener_spawns_pending_connection_on_syn_and_accept_migrates_it() {
        let demux = Arc::new(TcpDemux::new((49152, 65535)));
        let local = ep(1, 80);
        let remote = ep(2, 4000);
        let store = Arc::new(StdMutex::new(Vec::new()));
        let egress = egress_capturing(store.clone());
        let listener = TcpListener::bind(local, 1, demux.clone(), egress, TcpConfig::default()).unwrap();

        let syn = TcpSegment {
            src_port: remote.port,
            dst_port: local.port,
            seq: 500,
            ack: 0,
            flags: TcpFlags::SYN,
            window: 1000,
            urgent: 0,
            options: Vec::new(),
            data: Vec::new(),
        };
        let rst = dispatch(&demux, local, remote, &syn);
        assert!(rst.is_none());
        let synack = store.lock().unwrap().remove(0);
        assert!(synack.flags.contains(TcpFlags::SYN) && synack.flags.contains(TcpFlags::ACK));

        let ack = TcpSegment {
            src_port: remote.port,
            dst_port: local.port,
            seq: syn.seq.wrapping_add(1),
            ack: synack.seq.wrapping_add(1),
            flags: TcpFlags::ACK,
            window: 1000,
            urgent: 0,
            options: Vec::new(),
            data: Vec::new(),
        };
        dispatch(&demux, local, remote, &ack);

        let accepted = listener.accept().unwrap();
        assert_eq!(accepted.state(), TcpState::Established);
        assert_eq!(accepted.remote_addr(), remote);
    }

    #[test]
    fn dispatch_rsts_unknown_non_syn_segment() {
        let demux = Arc::new(TcpDemux::new((49152, 65535)));
        let local = ep(1, 80);
        let remote = ep(2, 4000);
        let ack = TcpSegment {
            src_port: remote.port,
            dst_port: local.port,
            seq: 1,
            ack: 900,
            flags: TcpFlags::ACK,
            window: 1000,
            urgent: 0,
            options: Vec::new(),
            data: Vec::new(),
        };
        let rst = dispatch(&demux, local, remote, &ack).expect("expected a RST");
        assert!(rst.flags.contains(TcpFlags::RST));
    }
}
