//! The link-layer collaborator the stack consumes but does not implement:
//! raw frame I/O and Ethernet framing live outside this crate's scope.

use crate::error::{NetworkError, Result};
use crate::wire::MacAddr;

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const MIN_ETHERNET_PAYLOAD: usize = 46;

/// A received Ethernet frame's header fields plus its payload.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub ether_type: u16,
    pub payload: Vec<u8>,
}

/// Provided by the link layer (out of scope here): reading/writing raw
/// Ethernet frames from/to a NIC or packet socket.
pub trait FrameTransport: Send + Sync {
    fn write_frame(&self, destination: MacAddr, ether_type: u16, payload: &[u8]) -> Result<()>;
    /// Blocks until the next frame arrives.
    fn read_frame(&self) -> Result<ReceivedFrame>;
    fn local_mac(&self) -> MacAddr;
    fn name(&self) -> &str;
}

/// Serializes a 14-byte Ethernet II header and pads the payload to the
/// minimum frame size, for transports that want a ready-to-send buffer
/// rather than separate header fields.
pub fn frame_bytes(local_mac: MacAddr, destination: MacAddr, ether_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(14 + payload.len().max(MIN_ETHERNET_PAYLOAD));
    buf.extend_from_slice(&destination.bytes());
    buf.extend_from_slice(&local_mac.bytes());
    buf.extend_from_slice(&ether_type.to_be_bytes());
    buf.extend_from_slice(payload);
    while buf.len() < 14 + MIN_ETHERNET_PAYLOAD {
        buf.push(0);
    }
    buf
}
