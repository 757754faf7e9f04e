//! ARP: packet codec, TTL'd cache, and a request-coalescing resolver (C3).

mod cache;
mod resolver;

pub use cache::ArpCache;
pub use resolver::{ArpResolver, PendingState};

use crate::error::ParseError;
use crate::wire::{Cursor, CursorMut, Ipv4Addr, MacAddr};

pub const HTYPE_ETHERNET: u16 = 1;
pub const PTYPE_IPV4: u16 = 0x0800;
pub const PACKET_LEN: usize = 28;

/// ARP operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Request,
    Reply,
}

/// A parsed ARP packet (IPv4-over-Ethernet only; any other hardware/protocol
/// combination is rejected at parse time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: Operation,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(buf: &[u8]) -> Result<ArpPacket, ParseError> {
        let mut cursor = Cursor::new(buf);
        let htype = cursor.read_u16()?;
        let ptype = cursor.read_u16()?;
        let hlen = cursor.read_u8()?;
        let plen = cursor.read_u8()?;
        if htype != HTYPE_ETHERNET || ptype != PTYPE_IPV4 || hlen != 6 || plen != 4 {
            return Err(ParseError::Unsupported("arp hwtype/proto"));
        }
        let op = cursor.read_u16()?;
        let operation = match op {
            1 => Operation::Request,
            2 => Operation::Reply,
            _ => return Err(ParseError::Unsupported("arp operation")),
        };
        let sender_mac = cursor.read_mac()?;
        let sender_ip = cursor.read_ipv4()?;
        let target_mac = cursor.read_mac()?;
        let target_ip = cursor.read_ipv4()?;
        Ok(ArpPacket {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    pub fn serialize(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        let mut cursor = CursorMut::new(&mut buf);
        cursor.write_u16(HTYPE_ETHERNET).unwrap();
        cursor.write_u16(PTYPE_IPV4).unwrap();
        cursor.write_u8(6).unwrap();
        cursor.write_u8(4).unwrap();
        cursor
            .write_u16(match self.operation {
                Operation::Request => 1,
                Operation::Reply => 2,
            })
            .unwrap();
        cursor.write_mac(&self.sender_mac).unwrap();
        cursor.write_ipv4(&self.sender_ip).unwrap();
        cursor.write_mac(&self.target_mac).unwrap();
        cursor.write_ipv4(&self.target_ip).unwrap();
        buf
    }

    /// A request for `target_ip`, sent by `sender_mac`/`sender_ip`.
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        ArpPacket {
            operation: Operation::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    /// Gratuitous ARP: a request where sender IP == target IP.
    pub fn gratuitous(sender_mac: MacAddr, ip: Ipv4Addr) -> Self {
        Self::request(sender_mac, ip, ip)
    }

    /// A unicast reply to `request`, sent by `sender_mac`/`sender_ip`.
    pub fn reply_to(
        request: &ArpPacket,
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
    ) -> Self {
        ArpPacket {
            operation: Operation::Reply,
            sender_mac,
            sender_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request() {
        // S1 from spec.md section 8.
        let bytes: [u8; 28] = [
            0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0xC0, 0xA8, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0xA8, 0x01, 0x02,
        ];
        let pkt = ArpPacket::parse(&bytes).unwrap();
        assert_eq!(pkt.operation, Operation::Request);
        assert_eq!(pkt.sender_mac, MacAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert_eq!(pkt.sender_ip, Ipv4Addr::new([192, 168, 1, 1]));
        assert_eq!(pkt.target_ip, Ipv4Addr::new([192, 168, 1, 2]));
    }

    #[test]
    fn rejects_non_ethernet_ipv4() {
        let mut bytes: [u8; 28] = [
            0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
            0xC0, 0xA8, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0xA8, 0x01, 0x02,
        ];
        bytes[1] = 0x06; // htype = 6 (token ring), unsupported
        assert!(matches!(
            ArpPacket::parse(&bytes),
            Err(ParseError::Unsupported(_))
        ));
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let pkt = ArpPacket::request(
            MacAddr::new([1, 2, 3, 4, 5, 6]),
            Ipv4Addr::new([10, 0, 0, 1]),
            Ipv4Addr::new([10, 0, 0, 2]),
        );
        let bytes = pkt.serialize();
        assert_eq!(ArpPacket::parse(&bytes).unwrap(), pkt);
    }
}
