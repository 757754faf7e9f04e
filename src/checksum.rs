//! RFC 1071 Internet checksum and TCP/UDP pseudo-header composition.
//!
//! A single scalar definition is authoritative; any offload/vectorized
//! variant registered through [`set_offload`] must be bit-identical to it
//! (see the `UpdateChecksum` caveat in DESIGN.md — this crate only ships
//! the safe scalar path).

use crate::wire::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide flag for whether an optimized checksum path is enabled.
/// Purely informational today: the scalar implementation below is always
/// used, since no offload variant has been proven bit-identical yet.
static OFFLOAD_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn set_offload(enabled: bool) {
    OFFLOAD_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn offload_enabled() -> bool {
    OFFLOAD_ENABLED.load(Ordering::Relaxed)
}

/// Computes the one's-complement sum of 16-bit big-endian words, returning
/// its one's complement. An odd-length tail is padded with a trailing zero
/// byte. Empty input yields `0xFFFF`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Computes the checksum over several disjoint slices as if they were
/// concatenated, without allocating. Used to fold a pseudo-header and a
/// packet body into one checksum.
pub fn checksum_segments(segments: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut carry: Option<u8> = None;
    for segment in segments {
        let mut iter = segment.iter().copied();
        if let Some(c) = carry.take() {
            if let Some(b) = iter.next() {
                sum += u16::from_be_bytes([c, b]) as u32;
            } else {
                carry = Some(c);
                continue;
            }
        }
        loop {
            let Some(a) = iter.next() else { break };
            match iter.next() {
                Some(b) => sum += u16::from_be_bytes([a, b]) as u32,
                None => {
                    carry = Some(a);
                    break;
                }
            }
        }
    }
    if let Some(c) = carry {
        sum += u16::from_be_bytes([c, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// IP protocol numbers used in the pseudo-header.
pub const PROTO_UDP: u8 = 17;
pub const PROTO_TCP: u8 = 6;

/// Builds the 12-byte TCP/UDP pseudo-header: `src_ip || dst_ip || 0 ||
/// protocol || length`.
pub fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&src.octets());
    buf[4..8].copy_from_slice(&dst.octets());
    buf[8] = 0;
    buf[9] = protocol;
    buf[10..12].copy_from_slice(&length.to_be_bytes());
    buf
}

/// Computes a TCP/UDP-style checksum over a pseudo-header and packet body,
/// mapping a zero result to `0xFFFF` per RFC 768 (the convention this
/// stack also applies to TCP).
pub fn checksum_with_pseudo_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    packet: &[u8],
) -> u16 {
    let header = pseudo_header(src, dst, protocol, packet.len() as u16);
    let result = checksum_segments(&[&header, packet]);
    if result == 0 {
        0xFFFF
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_all_ones() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn rfc1071_example() {
        // S2 from spec.md section 8.
        let data = [0x00, 0x01, 0xF2, 0x03, 0xF4, 0xF5, 0xF6, 0xF7];
        assert_eq!(checksum(&data), 0x220D);
    }

    #[test]
    fn round_trip_is_zero_or_all_ones() {
        let data = b"hello, checksum world, odd length";
        let csum = checksum(data);
        let mut with_csum = data.to_vec();
        with_csum.extend_from_slice(&csum.to_be_bytes());
        let verify = checksum(&with_csum);
        assert!(verify == 0x0000 || verify == 0xFFFF, "got {:#06x}", verify);
    }

    #[test]
    fn segments_match_flat_concat() {
        let a = [0x00u8, 0x01, 0xF2, 0x03];
        let b = [0xF4u8, 0xF5, 0xF6, 0xF7];
        let mut flat = Vec::new();
        flat.extend_from_slice(&a);
        flat.extend_from_slice(&b);
        assert_eq!(checksum_segments(&[&a, &b]), checksum(&flat));
    }

    #[test]
    fn segments_carry_across_odd_boundary() {
        // Same bytes as rfc1071_example, split at an odd offset so the
        // carry byte logic is exercised.
        let a = [0x00u8, 0x01, 0xF2];
        let b = [0x03u8, 0xF4, 0xF5, 0xF6, 0xF7];
        assert_eq!(checksum_segments(&[&a, &b]), 0x220D);
    }

    #[test]
    fn pseudo_header_layout() {
        let src = Ipv4Addr::new([192, 168, 1, 1]);
        let dst = Ipv4Addr::new([192, 168, 1, 2]);
        let hdr = pseudo_header(src, dst, PROTO_UDP, 16);
        assert_eq!(&hdr[0..4], &[192, 168, 1, 1]);
        assert_eq!(&hdr[4..8], &[192, 168, 1, 2]);
        assert_eq!(hdr[8], 0);
        assert_eq!(hdr[9], 17);
        assert_eq!(&hdr[10..12], &[0, 16]);
    }
}
