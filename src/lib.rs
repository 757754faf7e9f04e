//! `kpio-network`: a user-space TCP/IP stack (ARP, IPv4 with fragmentation,
//! UDP, and TCP with NewReno congestion control) built over a pluggable
//! [`transport::FrameTransport`].
//!
//! # Architecture
//!
//! - [`checksum`]: RFC 1071 Internet checksum and pseudo-header composition.
//! - [`wire`]: the big-endian cursor codec shared by every packet format,
//!   plus the [`wire::MacAddr`]/[`wire::Ipv4Addr`] address types.
//! - [`arp`]: ARP packet codec, TTL'd cache, request-coalescing resolver.
//! - [`routing`]: longest-prefix-match routing table and interface registry.
//! - [`ipv4`]: IPv4 packet codec, TTL handling, fragmentation/reassembly.
//! - [`udp`]: UDP packet codec, sockets, and the port demultiplexer.
//! - [`tcp`]: TCP segment codec, the connection state machine (RTT/RTO
//!   estimation, NewReno congestion control, retransmission), and the
//!   socket-style `listen`/`accept`/`connect`/`send`/`recv` API.
//! - [`transport`]: the `FrameTransport` contract the link layer (out of
//!   scope for this crate) must implement.
//! - [`stack`]: the top-level [`stack::Stack`] type wiring all of the above
//!   together and driving its background housekeeping/timer/ingress threads.
//! - [`config`]: process-wide tunables, gathered per subsystem.
//! - [`error`]: the shared [`error::NetworkError`] and [`error::ParseError`]
//!   types returned across the public API.

pub mod arp;
pub mod checksum;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod ipv4;
pub mod routing;
pub mod stack;
pub mod tcp;
pub mod transport;
pub mod udp;
pub mod wire;

pub use config::StackConfig;
pub use endpoint::Endpoint;
pub use error::{NetworkError, Result};
pub use stack::Stack;
pub use transport::FrameTransport;
pub use wire::{Ipv4Addr, MacAddr};
