//! TCP header and options codec (C7, RFC 793 + RFC 1122/1323/2018/7413).

use crate::checksum;
use crate::error::ParseError;
use crate::wire::{Cursor, CursorMut, Ipv4Addr};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u16 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

/// A single TCP SACK block: `[left_edge, right_edge)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    Mss(u16),
    WindowScale(u8),
    SackPermitted,
    Sack(Vec<SackBlock>),
    Timestamp { value: u32, echo_reply: u32 },
    Tfo(Vec<u8>),
    Unknown { kind: u8, data: Vec<u8> },
}

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WSCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;
const OPT_TIMESTAMP: u8 = 8;
const OPT_TFO: u8 = 34;

fn parse_options(bytes: &[u8]) -> Vec<TcpOption> {
    let mut options = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            OPT_EOL => break,
            OPT_NOP => i += 1,
            kind => {
                if i + 1 >= bytes.len() {
                    break;
                }
                let len = bytes[i + 1] as usize;
                if len < 2 || i + len > bytes.len() {
                    break;
                }
                let payload = &bytes[i + 2..i + len];
                let option = match kind {
                    OPT_MSS if payload.len() == 2 => {
                        TcpOption::Mss(u16::from_be_bytes([payload[0], payload[1]]))
                    }
                    OPT_WSCALE if payload.len() == 1 => TcpOption::WindowScale(payload[0]),
                    OPT_SACK_PERMITTED => TcpOption::SackPermitted,
                    OPT_SACK if payload.len() % 8 == 0 => TcpOption::Sack(
                        payload
                            .chunks_exact(8)
                            .map(|c| SackBlock {
                                left: u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                                right: u32::from_be_bytes([c[4], c[5], c[6], c[7]]),
                            })
                            .collect(),
                    ),
                    OPT_TIMESTAMP if payload.len() == 8 => TcpOption::Timestamp {
                        value: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                        echo_reply: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    },
                    OPT_TFO => TcpOption::Tfo(payload.to_vec()),
                    _ => TcpOption::Unknown {
                        kind,
                        data: payload.to_vec(),
                    },
                };
                options.push(option);
                i += len;
            }
        }
    }
    options
}

fn serialize_options(options: &[TcpOption]) -> Vec<u8> {
    let mut buf = Vec::new();
    for opt in options {
        match opt {
            TcpOption::Mss(mss) => {
                buf.push(OPT_MSS);
                buf.push(4);
                buf.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                buf.push(OPT_WSCALE);
                buf.push(3);
                buf.push(*shift);
            }
            TcpOption::SackPermitted => {
                buf.push(OPT_SACK_PERMITTED);
                buf.push(2);
            }
            TcpOption::Sack(blocks) => {
                let blocks = &blocks[..blocks.len().min(4)];
                buf.push(OPT_SACK);
                buf.push((2 + 8 * blocks.len()) as u8);
                for b in blocks {
                    buf.extend_from_slice(&b.left.to_be_bytes());
                    buf.extend_from_slice(&b.right.to_be_bytes());
                }
            }
            TcpOption::Timestamp { value, echo_reply } => {
                buf.push(OPT_TIMESTAMP);
                buf.push(10);
                buf.extend_from_slice(&value.to_be_bytes());
                buf.extend_from_slice(&echo_reply.to_be_bytes());
            }
            TcpOption::Tfo(cookie) => {
                buf.push(OPT_TFO);
                buf.push((2 + cookie.len()) as u8);
                buf.extend_from_slice(cookie);
            }
            TcpOption::Unknown { kind, data } => {
                buf.push(*kind);
                buf.push((2 + data.len()) as u8);
                buf.extend_from_slice(data);
            }
        }
    }
    // Pad to a 4-byte boundary with NOPs.
    while buf.len() % 4 != 0 {
        buf.push(OPT_NOP);
    }
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
    pub data: Vec<u8>,
}

impl TcpSegment {
    pub fn data_offset_words(&self) -> u8 {
        let opt_len = serialize_options(&self.options).len();
        5 + (opt_len / 4) as u8
    }

    pub fn header_len(&self) -> usize {
        self.data_offset_words() as usize * 4
    }

    pub fn total_len(&self) -> usize {
        self.header_len() + self.data.len()
    }

    pub fn parse(buf: &[u8]) -> Result<TcpSegment, ParseError> {
        let mut cursor = Cursor::new(buf);
        let src_port = cursor.read_u16()?;
        let dst_port = cursor.read_u16()?;
        let seq = cursor.read_u32()?;
        let ack = cursor.read_u32()?;
        let offset_reserved_flags = cursor.read_u16()?;
        let data_offset = (offset_reserved_flags >> 12) as u8;
        if data_offset < 5 {
            return Err(ParseError::Malformed("tcp data_offset < 5"));
        }
        let header_len = data_offset as usize * 4;
        if header_len > buf.len() {
            return Err(ParseError::Malformed("tcp header exceeds buffer"));
        }
        let flags = TcpFlags::from_bits_truncate(offset_reserved_flags & 0x01FF);
        let window = cursor.read_u16()?;
        let _checksum = cursor.read_u16()?;
        let urgent = cursor.read_u16()?;
        let options_len = header_len - 20;
        let option_bytes = cursor.read_bytes(options_len)?;
        let options = parse_options(option_bytes);
        let data = buf[header_len..].to_vec();

        Ok(TcpSegment {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            urgent,
            options,
            data,
        })
    }

    /// Serializes the segment, recomputing `data_offset` from the option
    /// area padded to a 4-byte boundary. Leaves the checksum field zeroed;
    /// use [`Self::serialize_with_checksum`] to fill it in.
    pub fn serialize(&self) -> Vec<u8> {
        let options = serialize_options(&self.options);
        let data_offset = 5 + (options.len() / 4) as u8;
        let header_len = data_offset as usize * 4;
        let mut buf = vec![0u8; header_len + self.data.len()];
        {
            let mut cursor = CursorMut::new(&mut buf);
            cursor.write_u16(self.src_port).unwrap();
            cursor.write_u16(self.dst_port).unwrap();
            cursor.write_u32(self.seq).unwrap();
            cursor.write_u32(self.ack).unwrap();
            let offset_flags = ((data_offset as u16) << 12) | self.flags.bits();
            cursor.write_u16(offset_flags).unwrap();
            cursor.write_u16(self.window).unwrap();
            cursor.write_u16(0).unwrap(); // checksum, filled by caller
            cursor.write_u16(self.urgent).unwrap();
            cursor.write_bytes(&options).unwrap();
            cursor.write_bytes(&self.data).unwrap();
        }
        buf
    }

    pub fn serialize_with_checksum(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let mut buf = self.serialize();
        let csum = checksum::checksum_with_pseudo_header(src_ip, dst_ip, checksum::PROTO_TCP, &buf);
        buf[16..18].copy_from_slice(&csum.to_be_bytes());
        buf
    }

    pub fn verify_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, raw: &[u8]) -> bool {
        checksum::checksum_with_pseudo_header(src_ip, dst_ip, checksum::PROTO_TCP, raw) == 0
    }

    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            TcpOption::Mss(v) => Some(*v),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TcpSegment {
        TcpSegment {
            src_port: 1234,
            dst_port: 80,
            seq: 1000,
            ack: 0,
            flags: TcpFlags::SYN,
            window: 65535,
            urgent: 0,
            options: vec![TcpOption::Mss(1460), TcpOption::WindowScale(7)],
            data: Vec::new(),
        }
    }

    #[test]
    fn roundtrip_with_options() {
        let seg = sample();
        let bytes = seg.serialize();
        let parsed = TcpSegment::parse(&bytes).unwrap();
        assert_eq!(parsed.src_port, seg.src_port);
        assert_eq!(parsed.seq, seg.seq);
        assert_eq!(parsed.flags, seg.flags);
        assert_eq!(parsed.mss(), Some(1460));
        assert!(parsed.options.contains(&TcpOption::WindowScale(7)));
    }

    #[test]
    fn checksum_verifies_after_serialize() {
        let seg = sample();
        let src = Ipv4Addr::new([10, 0, 0, 1]);
        let dst = Ipv4Addr::new([10, 0, 0, 2]);
        let bytes = seg.serialize_with_checksum(src, dst);
        assert!(TcpSegment::verify_checksum(src, dst, &bytes));
    }

    #[test]
    fn rejects_short_data_offset() {
        let mut bytes = sample().serialize();
        bytes[12] = 4 << 4; // data_offset = 4
        assert!(matches!(
            TcpSegment::parse(&bytes),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn sack_blocks_capped_at_four() {
        let blocks: Vec<SackBlock> = (0..6)
            .map(|i| SackBlock {
                left: i,
                right: i + 1,
            })
            .collect();
        let mut seg = sample();
        seg.options = vec![TcpOption::Sack(blocks)];
        let bytes = seg.serialize();
        let parsed = TcpSegment::parse(&bytes).unwrap();
        match &parsed.options[0] {
            TcpOption::Sack(b) => assert_eq!(b.len(), 4),
            other => panic!("expected Sack, got {:?}", other),
        }
    }

    #[test]
    fn nop_and_eol_are_handled() {
        let mut seg = sample();
        seg.options = vec![TcpOption::SackPermitted];
        let bytes = seg.serialize();
        // header_len computed from data_offset: 20 + padded(2)=4 => 24
        assert_eq!(bytes.len(), 24);
        // last 2 bytes of the 4-byte padded option area should be NOP (1)
        assert_eq!(bytes[22], 1);
        assert_eq!(bytes[23], 1);
        let parsed = TcpSegment::parse(&bytes).unwrap();
        assert!(parsed.options.contains(&TcpOption::SackPermitted));
    }
}
