//! Process-wide configuration defaults (spec §6), gathered in one struct so
//! they are not scattered across modules as magic numbers. A [`Stack`] may
//! be constructed with a non-default `StackConfig` to override any of
//! these per instance.

use std::time::Duration;

/// Tunables for the ARP resolver and cache.
#[derive(Debug, Clone, Copy)]
pub struct ArpConfig {
    /// How long a cache entry remains valid after being added.
    pub cache_ttl: Duration,
    /// Total time budget for a single `resolve()` call, split evenly
    /// across `max_retries` attempts.
    pub request_timeout: Duration,
    /// Maximum number of ARP request attempts per resolution.
    pub max_retries: u32,
}

impl Default for ArpConfig {
    fn default() -> Self {
        ArpConfig {
            cache_ttl: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(3),
            max_retries: 3,
        }
    }
}

/// Tunables for IPv4 fragmentation/reassembly.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Config {
    /// How long an incomplete reassembly entry survives without progress.
    pub reassembly_timeout: Duration,
    /// Interval between reassembly-map and ARP-cache GC sweeps.
    pub cleanup_interval: Duration,
    /// Outbound link MTU; payloads larger than this are fragmented.
    pub mtu: usize,
    /// Time-to-live stamped on packets this stack originates.
    pub default_ttl: u8,
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Ipv4Config {
            reassembly_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
            mtu: 1500,
            default_ttl: 64,
        }
    }
}

/// Tunables for UDP sockets and the port demultiplexer.
#[derive(Debug, Clone, Copy)]
pub struct UdpConfig {
    /// Capacity of a socket's inbound FIFO before newcomers are dropped.
    pub recv_buffer_messages: usize,
    /// Inclusive ephemeral port range scanned by `bind(_, 0)`.
    pub ephemeral_port_range: (u16, u16),
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            recv_buffer_messages: 100,
            ephemeral_port_range: (49152, 65535),
        }
    }
}

/// Tunables for the TCP connection engine.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    pub default_mss: u16,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub time_wait: Duration,
    pub default_window: u16,
    /// Deadline for a client-side `connect()` to reach ESTABLISHED.
    pub connect_timeout: Duration,
    /// Polling interval used while waiting for `connect()` to settle.
    pub connect_poll_interval: Duration,
    /// Maximum delay before an ACK for held-back data must be flushed.
    pub delayed_ack: Duration,
    /// How often the background timer thread drives retransmit/TIME_WAIT
    /// processing across all live connections.
    pub tick_interval: Duration,
    /// Inclusive ephemeral port range scanned by `connect()` when no local
    /// port is given.
    pub ephemeral_port_range: (u16, u16),
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            default_mss: 1460,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(60),
            time_wait: Duration::from_secs(120),
            default_window: 65535,
            connect_timeout: Duration::from_secs(10),
            connect_poll_interval: Duration::from_millis(100),
            delayed_ack: Duration::from_millis(500),
            tick_interval: Duration::from_millis(200),
            ephemeral_port_range: (49152, 65535),
        }
    }
}

/// Aggregate configuration for a [`Stack`](crate::stack::Stack).
#[derive(Debug, Clone, Copy, Default)]
pub struct StackConfig {
    pub arp: ArpConfig,
    pub ipv4: Ipv4Config,
    pub udp: UdpConfig,
    pub tcp: TcpConfig,
}
