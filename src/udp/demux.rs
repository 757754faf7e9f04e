//! UDP port demultiplexer: binds sockets to ports and routes inbound
//! datagrams to them.

use super::UdpSocket;
use crate::endpoint::Endpoint;
use crate::error::NetworkError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct UdpDemux {
    port_range: (u16, u16),
    inner: RwLock<Inner>,
}

struct Inner {
    sockets: HashMap<u16, Arc<UdpSocket>>,
    next_ephemeral: u16,
}

impl UdpDemux {
    pub fn new(port_range: (u16, u16)) -> Self {
        UdpDemux {
            port_range,
            inner: RwLock::new(Inner {
                sockets: HashMap::new(),
                next_ephemeral: port_range.0,
            }),
        }
    }

    /// Binds `socket` to `port`. `port == 0` allocates from the ephemeral
    /// range by scanning a rolling pointer for the first unused port.
    pub fn bind(&self, socket: Arc<UdpSocket>, ip: crate::wire::Ipv4Addr, port: u16) -> Result<u16, NetworkError> {
        let mut inner = self.inner.write().unwrap();
        let assigned = if port == 0 {
            let (lo, hi) = self.port_range;
            let span = (hi - lo) as u32 + 1;
            let start = inner.next_ephemeral;
            let mut found = None;
            for i in 0..span {
                let candidate = lo + (((start - lo) as u32 + i) % span) as u16;
                if !inner.sockets.contains_key(&candidate) {
                    found = Some(candidate);
                    break;
                }
            }
            match found {
                Some(p) => {
                    inner.next_ephemeral = if p == hi { lo } else { p + 1 };
                    p
                }
                None => return Err(NetworkError::NoEphemeralPorts),
            }
        } else {
            if inner.sockets.contains_key(&port) {
                return Err(NetworkError::PortInUse);
            }
            port
        };

        socket.set_local_addr(Endpoint::new(ip, assigned));
        inner.sockets.insert(assigned, socket);
        Ok(assigned)
    }

    /// Routes an inbound datagram to the socket bound to `dst_port`.
    pub fn deliver(&self, dst_port: u16, data: Vec<u8>, from: Endpoint) -> Result<(), NetworkError> {
        let inner = self.inner.read().unwrap();
        match inner.sockets.get(&dst_port) {
            Some(socket) => {
                socket.deliver(data, from);
                Ok(())
            }
            None => {
                log::trace!("udp: no socket bound to port {}", dst_port);
                Err(NetworkError::State("no socket bound to this port".into()))
            }
        }
    }

    pub fn unbind(&self, port: u16) {
        self.inner.write().unwrap().sockets.remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Ipv4Addr;

    fn noop_transmit() -> Arc<dyn super::super::socket::UdpTransmit> {
        Arc::new(|_src: u16, _dst: Endpoint, _data: &[u8]| Ok(()))
    }

    #[test]
    fn explicit_bind_reserves_port() {
        let demux = UdpDemux::new((49152, 65535));
        let sock = Arc::new(UdpSocket::new(4, noop_transmit()));
        let port = demux.bind(sock.clone(), Ipv4Addr::new([10, 0, 0, 1]), 5000).unwrap();
        assert_eq!(port, 5000);

        let sock2 = Arc::new(UdpSocket::new(4, noop_transmit()));
        let err = demux
            .bind(sock2, Ipv4Addr::new([10, 0, 0, 1]), 5000)
            .unwrap_err();
        assert!(matches!(err, NetworkError::PortInUse));
    }

    #[test]
    fn ephemeral_allocation_scans_rolling_pointer() {
        let demux = UdpDemux::new((49152, 49154));
        let ip = Ipv4Addr::new([10, 0, 0, 1]);
        let p1 = demux
            .bind(Arc::new(UdpSocket::new(4, noop_transmit())), ip, 0)
            .unwrap();
        let p2 = demux
            .bind(Arc::new(UdpSocket::new(4, noop_transmit())), ip, 0)
            .unwrap();
        let p3 = demux
            .bind(Arc::new(UdpSocket::new(4, noop_transmit())), ip, 0)
            .unwrap();
        assert_eq!([p1, p2, p3], [49152, 49153, 49154]);

        let err = demux
            .bind(Arc::new(UdpSocket::new(4, noop_transmit())), ip, 0)
            .unwrap_err();
        assert!(matches!(err, NetworkError::NoEphemeralPorts));
    }

    #[test]
    fn deliver_to_unbound_port_errors() {
        let demux = UdpDemux::new((49152, 65535));
        let from = Endpoint::new(Ipv4Addr::new([10, 0, 0, 9]), 1);
        assert!(demux.deliver(12345, vec![1], from).is_err());
    }
}
