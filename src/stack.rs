//! Top-level `Stack`: wires the checksum/wire/ARP/routing/IPv4/UDP/TCP
//! layers together over one [`FrameTransport`], and owns the background
//! threads (ARP/fragment GC sweep, TCP timer tick, frame ingress loop).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::arp::{self, ArpCache, ArpPacket, ArpResolver};
use crate::config::StackConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::ipv4::fragment::Fragmenter;
use crate::ipv4::{self, Ipv4Packet};
use crate::routing::RoutingTable;
use crate::tcp::connection::SegmentTransmit;
use crate::tcp::segment::TcpSegment;
use crate::tcp::socket::{self as tcp_socket, TcpEgress};
use crate::tcp::{TcpDemux, TcpListener, TcpSocket};
use crate::transport::{self, FrameTransport, ReceivedFrame};
use crate::udp::socket::UdpTransmit;
use crate::udp::{UdpDemux, UdpPacket, UdpSocket};
use crate::wire::{Ipv4Addr, MacAddr};

/// The pieces an outbound UDP datagram or TCP segment needs to become an
/// Ethernet frame: route lookup, ARP resolution, fragmentation, framing.
/// Held independently of [`Stack`] so socket-side transmit closures don't
/// keep a cycle back through it.
struct Egress {
    local_ip: Ipv4Addr,
    routing: Arc<RoutingTable>,
    arp: Arc<ArpResolver>,
    fragmenter: Arc<Fragmenter>,
    transport: Arc<dyn FrameTransport>,
    mtu: usize,
    default_ttl: u8,
}

impl Egress {
    fn send_ipv4(&self, dst_ip: Ipv4Addr, protocol: u8, payload: Vec<u8>) -> Result<()> {
        let (_route, next_hop) = self.routing.lookup(dst_ip)?;
        let dst_mac = if next_hop.is_broadcast() {
            MacAddr::BROADCAST
        } else {
            self.arp.resolve(next_hop)?
        };

        let packet = Ipv4Packet {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            ident: 0,
            flags: ipv4::Flags::empty(),
            frag_offset: 0,
            ttl: self.default_ttl,
            protocol,
            source: self.local_ip,
            dest: dst_ip,
            options: Vec::new(),
            payload,
        };

        for fragment in self.fragmenter.fragment(packet, self.mtu) {
            let bytes = fragment.serialize();
            self.transport
                .write_frame(dst_mac, transport::ETHERTYPE_IPV4, &bytes)?;
        }
        Ok(())
    }
}

struct TcpEgressImpl {
    egress: Arc<Egress>,
}

impl TcpEgress for TcpEgressImpl {
    fn make_transmit(&self, local: Endpoint, remote: Endpoint) -> Arc<dyn SegmentTransmit> {
        let egress = self.egress.clone();
        Arc::new(move |segment: TcpSegment| {
            let bytes = segment.serialize_with_checksum(local.ip, remote.ip);
            if let Err(e) = egress.send_ipv4(remote.ip, ipv4::PROTO_TCP, bytes) {
                warn!("tcp: failed to transmit segment {} -> {}: {}", local, remote, e);
            }
        })
    }
}

/// A full user-space TCP/IP stack bound to one local address over one
/// [`FrameTransport`]. Construction spawns the background housekeeping,
/// TCP timer, and frame-ingress threads; drop (or [`Stack::shutdown`])
/// stops scheduling further work on them.
pub struct Stack {
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    config: StackConfig,
    transport: Arc<dyn FrameTransport>,
    arp_cache: Arc<ArpCache>,
    arp: Arc<ArpResolver>,
    routing: Arc<RoutingTable>,
    fragmenter: Arc<Fragmenter>,
    udp_demux: Arc<UdpDemux>,
    tcp_demux: Arc<TcpDemux>,
    tcp_egress: Arc<dyn TcpEgress>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    /// Builds the stack and starts its background threads. `iface` names
    /// the local interface entry registered with the routing table.
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        local_ip: Ipv4Addr,
        iface: impl Into<String>,
        config: StackConfig,
    ) -> Arc<Self> {
        let local_mac = transport.local_mac();
        let iface = iface.into();

        let arp_cache = Arc::new(ArpCache::new(config.arp.cache_ttl));
        let arp_send_transport = transport.clone();
        let arp_transmit = Arc::new(move |pkt: &ArpPacket| {
            let dst_mac = if pkt.operation == arp::Operation::Reply && pkt.target_mac != MacAddr::ZERO {
                pkt.target_mac
            } else {
                MacAddr::BROADCAST
            };
            let bytes = pkt.serialize();
            if let Err(e) = arp_send_transport.write_frame(dst_mac, transport::ETHERTYPE_ARP, &bytes) {
                warn!("arp: failed to send frame: {}", e);
            }
        });
        let arp: Arc<ArpResolver> = Arc::new(ArpResolver::new(
            arp_cache.clone(),
            arp_transmit,
            local_mac,
            local_ip,
            config.arp.max_retries,
            config.arp.request_timeout,
        ));

        let routing = Arc::new(RoutingTable::new());
        routing.add_local_interface(&iface, local_ip);

        let fragmenter = Arc::new(Fragmenter::new(config.ipv4.reassembly_timeout));

        let egress = Arc::new(Egress {
            local_ip,
            routing: routing.clone(),
            arp: arp.clone(),
            fragmenter: fragmenter.clone(),
            transport: transport.clone(),
            mtu: config.ipv4.mtu,
            default_ttl: config.ipv4.default_ttl,
        });

        let udp_demux = Arc::new(UdpDemux::new(config.udp.ephemeral_port_range));
        let tcp_demux = Arc::new(TcpDemux::new(config.tcp.ephemeral_port_range));
        let tcp_egress: Arc<dyn TcpEgress> = Arc::new(TcpEgressImpl { egress: egress.clone() });

        let stack = Arc::new(Stack {
            local_mac,
            local_ip,
            config,
            transport,
            arp_cache,
            arp,
            routing,
            fragmenter,
            udp_demux,
            tcp_demux,
            tcp_egress,
            running: Arc::new(AtomicBool::new(true)),
            threads: Mutex::new(Vec::new()),
        });

        stack.spawn_background_threads(egress);
        stack
    }

    fn spawn_background_threads(self: &Arc<Self>, egress: Arc<Egress>) {
        let mut threads = self.threads.lock().unwrap();

        let housekeeping = {
            let running = self.running.clone();
            let arp_cache = self.arp_cache.clone();
            let fragmenter = self.fragmenter.clone();
            let interval = self.config.ipv4.cleanup_interval;
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    let arp_reclaimed = arp_cache.cleanup();
                    let frag_reclaimed = fragmenter.cleanup();
                    if arp_reclaimed > 0 || frag_reclaimed > 0 {
                        debug!(
                            "housekeeping: reclaimed {} arp entries, {} reassembly entries",
                            arp_reclaimed, frag_reclaimed
                        );
                    }
                }
            })
        };

        let tcp_timer = {
            let running = self.running.clone();
            let tcp_demux = self.tcp_demux.clone();
            let interval = self.config.tcp.tick_interval;
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    tcp_demux.tick_all();
                }
            })
        };

        let ingress = {
            let running = self.running.clone();
            let transport = self.transport.clone();
            let arp = self.arp.clone();
            let local_mac = self.local_mac;
            let local_ip = self.local_ip;
            let fragmenter = self.fragmenter.clone();
            let udp_demux = self.udp_demux.clone();
            let tcp_demux = self.tcp_demux.clone();
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    match transport.read_frame() {
                        Ok(frame) => handle_frame(
                            frame, local_mac, local_ip, &arp, &fragmenter, &udp_demux, &tcp_demux, &egress,
                        ),
                        Err(e) => {
                            warn!("ingress: transport read failed, stopping: {}", e);
                            break;
                        }
                    }
                }
            })
        };

        threads.push(housekeeping);
        threads.push(tcp_timer);
        threads.push(ingress);
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn arp_cache(&self) -> &Arc<ArpCache> {
        &self.arp_cache
    }

    /// Binds a UDP socket. `port == 0` allocates an ephemeral port.
    pub fn bind_udp(&self, port: u16) -> Result<Arc<UdpSocket>> {
        let egress = self.udp_egress();
        let socket = Arc::new(UdpSocket::new(self.config.udp.recv_buffer_messages, egress));
        self.udp_demux.bind(socket.clone(), self.local_ip, port)?;
        Ok(socket)
    }

    pub fn unbind_udp(&self, port: u16) {
        self.udp_demux.unbind(port);
    }

    fn udp_egress(&self) -> Arc<dyn UdpTransmit> {
        let egress = Arc::new(Egress {
            local_ip: self.local_ip,
            routing: self.routing.clone(),
            arp: self.arp.clone(),
            fragmenter: self.fragmenter.clone(),
            transport: self.transport.clone(),
            mtu: self.config.ipv4.mtu,
            default_ttl: self.config.ipv4.default_ttl,
        });
        Arc::new(move |src_port: u16, dst: Endpoint, data: &[u8]| {
            let packet = UdpPacket {
                src_port,
                dst_port: dst.port,
                checksum: 0,
                data: data.to_vec(),
            };
            let bytes = packet.serialize(egress.local_ip, dst.ip);
            egress.send_ipv4(dst.ip, ipv4::PROTO_UDP, bytes)
        })
    }

    /// Client-side active open, blocking until ESTABLISHED or timeout.
    pub fn connect_tcp(&self, remote: Endpoint) -> Result<TcpSocket> {
        TcpSocket::connect(
            self.local_ip,
            None,
            remote,
            self.tcp_demux.clone(),
            self.tcp_egress.clone(),
            self.config.tcp,
        )
    }

    /// Binds a listening TCP socket on `port`.
    pub fn listen_tcp(&self, port: u16, backlog: usize) -> Result<Arc<TcpListener>> {
        let local = Endpoint::new(self.local_ip, port);
        TcpListener::bind(local, backlog, self.tcp_demux.clone(), self.tcp_egress.clone(), self.config.tcp)
    }

    /// Stops scheduling further housekeeping/timer work. The ingress thread
    /// exits on its next `read_frame` error, since blocking transports have
    /// no portable way to interrupt an in-flight read.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_frame(
    frame: ReceivedFrame,
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    arp: &Arc<ArpResolver>,
    fragmenter: &Arc<Fragmenter>,
    udp_demux: &Arc<UdpDemux>,
    tcp_demux: &Arc<TcpDemux>,
    egress: &Arc<Egress>,
) {
    if frame.dst != local_mac && frame.dst != MacAddr::BROADCAST && !frame.dst.is_multicast() {
        return;
    }

    match frame.ether_type {
        transport::ETHERTYPE_ARP => {
            let pkt = match ArpPacket::parse(&frame.payload) {
                Ok(p) => p,
                Err(e) => {
                    trace!("ingress: malformed arp packet: {}", e);
                    return;
                }
            };
            if let Some(reply) = arp.handle_incoming(&pkt) {
                let bytes = reply.serialize();
                if let Err(e) = egress
                    .transport
                    .write_frame(reply.target_mac, transport::ETHERTYPE_ARP, &bytes)
                {
                    warn!("arp: failed to send reply: {}", e);
                }
            }
        }
        transport::ETHERTYPE_IPV4 => {
            handle_ipv4(&frame.payload, local_ip, fragmenter, udp_demux, tcp_demux, egress);
        }
        other => trace!("ingress: ignoring unknown ethertype {:#06x}", other),
    }
}

fn handle_ipv4(
    payload: &[u8],
    local_ip: Ipv4Addr,
    fragmenter: &Arc<Fragmenter>,
    udp_demux: &Arc<UdpDemux>,
    tcp_demux: &Arc<TcpDemux>,
    egress: &Arc<Egress>,
) {
    let packet = match Ipv4Packet::parse(payload) {
        Ok(p) => p,
        Err(e) => {
            trace!("ingress: malformed ipv4 packet: {}", e);
            return;
        }
    };
    if packet.dest != local_ip && !packet.dest.is_broadcast() {
        return;
    }

    let packet = match fragmenter.reassemble(packet) {
        Some(p) => p,
        None => return,
    };

    match packet.protocol {
        ipv4::PROTO_UDP => {
            let udp = match UdpPacket::parse(&packet.payload) {
                Ok(p) => p,
                Err(e) => {
                    trace!("ingress: malformed udp packet: {}", e);
                    return;
                }
            };
            if !udp.verify_checksum(packet.source, packet.dest, &packet.payload) {
                warn!("ingress: udp checksum mismatch from {}", packet.source);
                return;
            }
            let from = Endpoint::new(packet.source, udp.src_port);
            if let Err(e) = udp_demux.deliver(udp.dst_port, udp.data, from) {
                trace!("ingress: {}", e);
            }
        }
        ipv4::PROTO_TCP => {
            if !TcpSegment::verify_checksum(packet.source, packet.dest, &packet.payload) {
                warn!("ingress: tcp checksum mismatch from {}", packet.source);
                return;
            }
            let seg = match TcpSegment::parse(&packet.payload) {
                Ok(s) => s,
                Err(e) => {
                    trace!("ingress: malformed tcp segment: {}", e);
                    return;
                }
            };
            let local = Endpoint::new(packet.dest, seg.dst_port);
            let remote = Endpoint::new(packet.source, seg.src_port);
            if let Some(rst) = tcp_socket::dispatch(tcp_demux, local, remote, &seg) {
                let bytes = rst.serialize_with_checksum(local.ip, remote.ip);
                if let Err(e) = egress.send_ipv4(remote.ip, ipv4::PROTO_TCP, bytes) {
                    warn!("tcp: failed to send rst to {}: {}", remote, e);
                }
            }
        }
        other => trace!("ingress: ignoring unknown ip protocol {}", other),
    }
}
