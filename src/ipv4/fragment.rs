//! IPv4 fragmentation and reassembly, with timeout-based GC (C5 §4.5, §4.9).

use super::{Flags, Ipv4Packet};
use crate::wire::Ipv4Addr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const IPV4_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct ReassemblyKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ident: u16,
    protocol: u8,
}

struct ReassemblyEntry {
    /// byte offset -> fragment payload bytes
    fragments: HashMap<usize, Vec<u8>>,
    total_length: Option<usize>,
    last_seen: Instant,
    first_fragment: Option<Ipv4Packet>,
}

impl ReassemblyEntry {
    fn new() -> Self {
        ReassemblyEntry {
            fragments: HashMap::new(),
            total_length: None,
            last_seen: Instant::now(),
            first_fragment: None,
        }
    }

    fn insert(&mut self, offset: usize, data: Vec<u8>) {
        self.last_seen = Instant::now();
        self.fragments.insert(offset, data);
    }

    /// Builds a fresh per-byte presence bitmap of length `total_length` and
    /// reports whether every byte in `[0, total_length)` has arrived.
    fn is_complete(&self) -> bool {
        let Some(total) = self.total_length else {
            return false;
        };
        let mut present = vec![false; total];
        for (&offset, data) in &self.fragments {
            for i in 0..data.len() {
                if offset + i < total {
                    present[offset + i] = true;
                }
            }
        }
        present.into_iter().all(|b| b)
    }

    fn assemble(&self) -> Vec<u8> {
        let total = self.total_length.unwrap();
        let mut buf = vec![0u8; total];
        // Sort by offset ascending so later (overwriting) fragments at the
        // same offset are applied after earlier ones for identical starts;
        // true overlap-at-same-offset "later write wins" is handled by
        // `insert` always storing the newest bytes under that offset key.
        let mut offsets: Vec<_> = self.fragments.keys().copied().collect();
        offsets.sort_unstable();
        for offset in offsets {
            let data = &self.fragments[&offset];
            let end = (offset + data.len()).min(total);
            if offset < end {
                buf[offset..end].copy_from_slice(&data[..end - offset]);
            }
        }
        buf
    }
}

/// Owns fragment identifiers, the reassembly map, and periodic GC.
pub struct Fragmenter {
    ident_counter: AtomicU16,
    reassembly: Mutex<HashMap<ReassemblyKey, ReassemblyEntry>>,
    reassembly_timeout: Duration,
}

impl Fragmenter {
    pub fn new(reassembly_timeout: Duration) -> Self {
        Fragmenter {
            ident_counter: AtomicU16::new(1),
            reassembly: Mutex::new(HashMap::new()),
            reassembly_timeout,
        }
    }

    fn next_ident(&self) -> u16 {
        let id = self.ident_counter.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.ident_counter.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Splits `packet` into MTU-sized fragments, or returns it unchanged
    /// (as the single element) if it already fits.
    pub fn fragment(&self, mut packet: Ipv4Packet, mtu: usize) -> Vec<Ipv4Packet> {
        let header_size = packet.header_len();
        if header_size + packet.payload.len() <= mtu {
            return vec![packet];
        }

        if packet.ident == 0 {
            packet.ident = self.next_ident();
        }

        let max_frag_payload = ((mtu.saturating_sub(header_size)) / 8) * 8;
        assert!(max_frag_payload > 0, "mtu too small to fragment");

        let options = packet.options.clone();
        let payload = packet.payload;
        let mut fragments = Vec::new();
        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + max_frag_payload).min(payload.len());
            let is_last = end == payload.len();
            let mut flags = packet.flags;
            flags.remove(Flags::MF);
            if !is_last {
                flags.insert(Flags::MF);
            }
            fragments.push(Ipv4Packet {
                ihl: if offset == 0 { packet.ihl } else { 5 },
                dscp: packet.dscp,
                ecn: packet.ecn,
                ident: packet.ident,
                flags,
                frag_offset: (offset / 8) as u16,
                ttl: packet.ttl,
                protocol: packet.protocol,
                source: packet.source,
                dest: packet.dest,
                options: if offset == 0 { options.clone() } else { Vec::new() },
                payload: payload[offset..end].to_vec(),
            });
            offset = end;
        }
        fragments
    }

    /// Feeds one incoming packet through reassembly. Non-fragments pass
    /// straight through. Returns `Some(packet)` once all bytes `[0,
    /// total_length)` have been received for a given fragment train.
    pub fn reassemble(&self, packet: Ipv4Packet) -> Option<Ipv4Packet> {
        if !packet.is_fragment() {
            return Some(packet);
        }

        let key = ReassemblyKey {
            src: packet.source,
            dst: packet.dest,
            ident: packet.ident,
            protocol: packet.protocol,
        };
        let byte_offset = packet.frag_offset as usize * 8;
        let is_last = !packet.flags.contains(Flags::MF);

        let mut map = self.reassembly.lock().unwrap();
        let entry = map.entry(key.clone()).or_insert_with(ReassemblyEntry::new);

        if byte_offset == 0 {
            entry.first_fragment = Some(Ipv4Packet {
                payload: Vec::new(),
                ..packet.clone()
            });
        }
        if is_last {
            entry.total_length = Some(byte_offset + packet.payload.len());
        }
        entry.insert(byte_offset, packet.payload);

        if entry.is_complete() {
            let assembled_payload = entry.assemble();
            let first = entry.first_fragment.clone().unwrap_or(packet_for_key(&key));
            map.remove(&key);
            let mut result = first;
            result.flags.remove(Flags::MF);
            result.frag_offset = 0;
            result.payload = assembled_payload;
            Some(result)
        } else {
            None
        }
    }

    /// Sweeps the reassembly map, dropping entries that have not advanced
    /// for longer than the configured timeout. Call this from a periodic
    /// tick (every `cleanup_interval`, per spec §4.5).
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut map = self.reassembly.lock().unwrap();
        let before = map.len();
        map.retain(|_, entry| now.duration_since(entry.last_seen) < self.reassembly_timeout);
        before - map.len()
    }
}

fn packet_for_key(key: &ReassemblyKey) -> Ipv4Packet {
    Ipv4Packet {
        ihl: 5,
        dscp: 0,
        ecn: 0,
        ident: key.ident,
        flags: Flags::empty(),
        frag_offset: 0,
        ttl: 64,
        protocol: key.protocol,
        source: key.src,
        dest: key.dst,
        options: Vec::new(),
        payload: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::PROTO_UDP;

    fn base_packet(payload: Vec<u8>) -> Ipv4Packet {
        Ipv4Packet {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            ident: 0,
            flags: Flags::empty(),
            frag_offset: 0,
            ttl: 64,
            protocol: PROTO_UDP,
            source: Ipv4Addr::new([10, 0, 0, 1]),
            dest: Ipv4Addr::new([10, 0, 0, 2]),
            options: Vec::new(),
            payload,
        }
    }

    #[test]
    fn fits_in_one_fragment_when_small() {
        let f = Fragmenter::new(Duration::from_secs(60));
        let pkt = base_packet(vec![1, 2, 3]);
        let frags = f.fragment(pkt.clone(), 1500);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0], pkt);
    }

    #[test]
    fn s3_fragment_and_reassemble_out_of_order() {
        // S3 from spec.md section 8: 3000-byte payload, MTU 1500.
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        let pkt = base_packet(payload.clone());

        let f = Fragmenter::new(Duration::from_secs(60));
        let frags = f.fragment(pkt, 1500);
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].frag_offset, 0);
        assert_eq!(frags[1].frag_offset, 1480 / 8);
        assert_eq!(frags[2].frag_offset, 2960 / 8);
        assert_eq!(frags[2].payload.len(), 40);
        assert!(frags[0].flags.contains(Flags::MF));
        assert!(frags[1].flags.contains(Flags::MF));
        assert!(!frags[2].flags.contains(Flags::MF));

        let r = Fragmenter::new(Duration::from_secs(60));
        assert!(r.reassemble(frags[2].clone()).is_none());
        assert!(r.reassemble(frags[0].clone()).is_none());
        let result = r.reassemble(frags[1].clone()).unwrap();
        assert_eq!(result.payload, payload);
        assert!(!result.is_fragment());
    }

    #[test]
    fn overlapping_fragments_last_write_wins() {
        let r = Fragmenter::new(Duration::from_secs(60));
        let mut first = base_packet(vec![0xAA; 16]);
        first.ident = 7;
        first.flags.insert(Flags::MF);
        let mut last = base_packet(vec![0xBB; 8]);
        last.ident = 7;
        last.frag_offset = 1; // byte offset 8, overlapping bytes [8,16) from `first`

        assert!(r.reassemble(first).is_none());
        let result = r.reassemble(last).unwrap();
        assert_eq!(&result.payload[0..8], &[0xAA; 8]);
        assert_eq!(&result.payload[8..16], &[0xBB; 8]);
    }

    #[test]
    fn stale_entries_are_gced() {
        let f = Fragmenter::new(Duration::from_millis(1));
        let mut frag = base_packet(vec![1, 2, 3]);
        frag.ident = 42;
        frag.flags.insert(Flags::MF);
        assert!(f.reassemble(frag).is_none());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(f.cleanup(), 1);
    }
}
