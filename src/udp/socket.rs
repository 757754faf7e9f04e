//! A single UDP socket: a bounded inbound FIFO plus send-side wiring to the
//! stack's egress path.

use super::UdpPacket;
use crate::endpoint::Endpoint;
use crate::error::{NetworkError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Sends a UDP payload toward `dst`. Wired by the owning [`Stack`](crate::stack::Stack)
/// to the routing/ARP/egress pipeline.
pub trait UdpTransmit: Send + Sync {
    fn send_to(&self, src_port: u16, dst: Endpoint, data: &[u8]) -> Result<()>;
}

impl<F: Fn(u16, Endpoint, &[u8]) -> Result<()> + Send + Sync> UdpTransmit for F {
    fn send_to(&self, src_port: u16, dst: Endpoint, data: &[u8]) -> Result<()> {
        self(src_port, dst, data)
    }
}

struct Inbox {
    queue: VecDeque<(Vec<u8>, Endpoint)>,
    closed: bool,
    dropped: u64,
}

/// A UDP socket bound to a local port.
pub struct UdpSocket {
    local_addr: Mutex<Option<Endpoint>>,
    inbox: Mutex<Inbox>,
    cv: Condvar,
    capacity: usize,
    transmit: Arc<dyn UdpTransmit>,
}

impl UdpSocket {
    pub(crate) fn new(capacity: usize, transmit: Arc<dyn UdpTransmit>) -> Self {
        UdpSocket {
            local_addr: Mutex::new(None),
            inbox: Mutex::new(Inbox {
                queue: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            cv: Condvar::new(),
            capacity,
            transmit,
        }
    }

    pub(crate) fn set_local_addr(&self, addr: Endpoint) {
        *self.local_addr.lock().unwrap() = Some(addr);
    }

    pub fn local_addr(&self) -> Option<Endpoint> {
        *self.local_addr.lock().unwrap()
    }

    /// Sends `data` to `dst`.
    pub fn send_to(&self, data: &[u8], dst: Endpoint) -> Result<()> {
        let local = self.local_addr().ok_or(NetworkError::SocketClosed)?;
        self.transmit.send_to(local.port, dst, data)
    }

    /// Delivers an inbound datagram, dropping it if the inbox is full.
    pub(crate) fn deliver(&self, data: Vec<u8>, from: Endpoint) {
        let mut inbox = self.inbox.lock().unwrap();
        if inbox.queue.len() >= self.capacity {
            inbox.dropped += 1;
            log::warn!("udp: inbox full for {:?}, dropping datagram from {}", self.local_addr(), from);
            return;
        }
        inbox.queue.push_back((data, from));
        self.cv.notify_one();
    }

    /// Blocks until a datagram arrives or `timeout` elapses.
    pub fn recv_from(&self, timeout: Duration) -> Result<(Vec<u8>, Endpoint)> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock().unwrap();
        loop {
            if let Some(item) = inbox.queue.pop_front() {
                return Ok(item);
            }
            if inbox.closed {
                return Err(NetworkError::SocketClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NetworkError::Timeout);
            }
            let (guard, result) = self.cv.wait_timeout(inbox, deadline - now).unwrap();
            inbox = guard;
            if result.timed_out() && inbox.queue.is_empty() {
                return Err(NetworkError::Timeout);
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.inbox.lock().unwrap().dropped
    }

    pub fn close(&self) {
        let mut inbox = self.inbox.lock().unwrap();
        inbox.closed = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_transmit() -> Arc<dyn UdpTransmit> {
        Arc::new(|_src: u16, _dst: Endpoint, _data: &[u8]| Ok(()))
    }

    #[test]
    fn recv_from_times_out_when_empty() {
        let sock = UdpSocket::new(4, noop_transmit());
        let err = sock.recv_from(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, NetworkError::Timeout));
    }

    #[test]
    fn deliver_then_recv() {
        let sock = UdpSocket::new(4, noop_transmit());
        let from = Endpoint::new(crate::wire::Ipv4Addr::new([10, 0, 0, 9]), 9000);
        sock.deliver(vec![1, 2, 3], from);
        let (data, got_from) = sock.recv_from(Duration::from_millis(50)).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(got_from, from);
    }

    #[test]
    fn overflow_drops_newcomer() {
        let sock = UdpSocket::new(1, noop_transmit());
        let from = Endpoint::new(crate::wire::Ipv4Addr::new([10, 0, 0, 9]), 9000);
        sock.deliver(vec![1], from);
        sock.deliver(vec![2], from);
        assert_eq!(sock.dropped_count(), 1);
        let (data, _) = sock.recv_from(Duration::from_millis(10)).unwrap();
        assert_eq!(data, vec![1]);
    }

    #[test]
    fn closed_socket_wakes_waiters() {
        let sock = Arc::new(UdpSocket::new(4, noop_transmit()));
        let s2 = sock.clone();
        let handle = std::thread::spawn(move || s2.recv_from(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        sock.close();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(NetworkError::SocketClosed)));
    }
}
