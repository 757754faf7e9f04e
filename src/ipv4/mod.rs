//! IPv4 packet codec and TTL handling (C5, RFC 791).

pub mod fragment;

pub use fragment::Fragmenter;

use crate::checksum;
use crate::error::ParseError;
use crate::wire::{Cursor, CursorMut, Ipv4Addr};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const DF = 0b010;
        const MF = 0b001;
    }
}

/// A parsed IPv4 packet. Options, when present, are carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub ihl: u8,
    pub dscp: u8,
    pub ecn: u8,
    pub ident: u16,
    pub flags: Flags,
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = checksum::PROTO_TCP;
pub const PROTO_UDP: u8 = checksum::PROTO_UDP;

impl Ipv4Packet {
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn total_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn parse(buf: &[u8]) -> Result<Ipv4Packet, ParseError> {
        let mut cursor = Cursor::new(buf);
        let version_ihl = cursor.read_u8()?;
        let version = version_ihl >> 4;
        let ihl = version_ihl & 0x0F;
        if version != 4 {
            return Err(ParseError::Unsupported("ipv4 version"));
        }
        if ihl < 5 {
            return Err(ParseError::Malformed("ihl < 5"));
        }
        let dscp_ecn = cursor.read_u8()?;
        let dscp = dscp_ecn >> 2;
        let ecn = dscp_ecn & 0x3;
        let total_length = cursor.read_u16()? as usize;
        if total_length > buf.len() {
            return Err(ParseError::Malformed("total_length exceeds buffer"));
        }
        let ident = cursor.read_u16()?;
        let flags_frag = cursor.read_u16()?;
        let flags = Flags::from_bits_truncate(((flags_frag >> 13) & 0x7) as u8);
        let frag_offset = flags_frag & 0x1FFF;
        let ttl = cursor.read_u8()?;
        let protocol = cursor.read_u8()?;
        let _checksum = cursor.read_u16()?;
        let source = cursor.read_ipv4()?;
        let dest = cursor.read_ipv4()?;

        let header_len = ihl as usize * 4;
        if header_len > total_length {
            return Err(ParseError::Malformed("ihl exceeds total_length"));
        }
        let options_len = header_len - 20;
        let options = cursor.read_bytes(options_len)?.to_vec();
        let payload = buf[header_len..total_length].to_vec();

        Ok(Ipv4Packet {
            ihl,
            dscp,
            ecn,
            ident,
            flags,
            frag_offset,
            ttl,
            protocol,
            source,
            dest,
            options,
            payload,
        })
    }

    /// Serializes the packet, zeroing then recomputing the header checksum,
    /// and padding options to a 4-byte boundary.
    pub fn serialize(&self) -> Vec<u8> {
        let padded_options_len = (self.options.len() + 3) / 4 * 4;
        let ihl = 5 + (padded_options_len / 4) as u8;
        let header_len = ihl as usize * 4;
        let total_length = header_len + self.payload.len();

        let mut buf = vec![0u8; total_length];
        {
            let mut cursor = CursorMut::new(&mut buf);
            cursor.write_u8((4 << 4) | ihl).unwrap();
            cursor.write_u8((self.dscp << 2) | self.ecn).unwrap();
            cursor.write_u16(total_length as u16).unwrap();
            cursor.write_u16(self.ident).unwrap();
            let flags_frag = ((self.flags.bits() as u16) << 13) | self.frag_offset;
            cursor.write_u16(flags_frag).unwrap();
            cursor.write_u8(self.ttl).unwrap();
            cursor.write_u8(self.protocol).unwrap();
            cursor.write_u16(0).unwrap(); // checksum, filled below
            cursor.write_ipv4(&self.source).unwrap();
            cursor.write_ipv4(&self.dest).unwrap();
            let mut padded_options = self.options.clone();
            padded_options.resize(padded_options_len, 0);
            cursor.write_bytes(&padded_options).unwrap();
            cursor.write_bytes(&self.payload).unwrap();
        }

        let csum = checksum::checksum(&buf[..header_len]);
        buf[10..12].copy_from_slice(&csum.to_be_bytes());
        buf
    }

    /// Decrements the TTL in place, returning `false` iff it reached zero
    /// (the packet must then be dropped by the caller).
    pub fn decrement_ttl(&mut self) -> bool {
        self.ttl = self.ttl.saturating_sub(1);
        self.ttl != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.flags.contains(Flags::MF) || self.frag_offset != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(payload: Vec<u8>) -> Ipv4Packet {
        Ipv4Packet {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            ident: 0x1234,
            flags: Flags::DF,
            frag_offset: 0,
            ttl: 64,
            protocol: PROTO_UDP,
            source: Ipv4Addr::new([192, 168, 1, 1]),
            dest: Ipv4Addr::new([192, 168, 1, 2]),
            options: Vec::new(),
            payload,
        }
    }

    #[test]
    fn parse_serialize_idempotent_up_to_checksum() {
        let pkt = sample_packet(vec![1, 2, 3, 4, 5]);
        let bytes = pkt.serialize();
        let parsed = Ipv4Packet::parse(&bytes).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn checksum_verifies() {
        let pkt = sample_packet(vec![0xAA; 20]);
        let bytes = pkt.serialize();
        assert_eq!(checksum::checksum(&bytes[..20]), 0);
    }

    #[test]
    fn rejects_bad_version() {
        let mut bytes = sample_packet(vec![1, 2, 3]).serialize();
        bytes[0] = (5 << 4) | 5;
        assert!(matches!(
            Ipv4Packet::parse(&bytes),
            Err(ParseError::Unsupported(_))
        ));
    }

    #[test]
    fn rejects_short_ihl() {
        let mut bytes = sample_packet(vec![1, 2, 3]).serialize();
        bytes[0] = (4 << 4) | 4;
        assert!(matches!(
            Ipv4Packet::parse(&bytes),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn options_roundtrip_padded() {
        let mut pkt = sample_packet(vec![9, 9, 9]);
        pkt.options = vec![1, 2, 3]; // padded to 4 bytes on serialize
        let bytes = pkt.serialize();
        let parsed = Ipv4Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.options, vec![1, 2, 3, 0]);
        assert_eq!(parsed.payload, vec![9, 9, 9]);
    }

    #[test]
    fn ttl_decrement_reports_expiry() {
        let mut pkt = sample_packet(vec![]);
        pkt.ttl = 1;
        assert!(!pkt.decrement_ttl());
        assert_eq!(pkt.ttl, 0);
    }
}
