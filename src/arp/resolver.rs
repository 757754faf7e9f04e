//! Request-coalescing ARP resolver.
//!
//! `resolve()` callers racing for the same target IP share one in-flight
//! slot: the first caller becomes the requestor and broadcasts retries: all
//! others just wait on the shared slot. The slot is fulfilled at most once
//! (first writer wins) and removed as soon as it settles.

use super::{ArpCache, ArpPacket};
use crate::error::NetworkError;
use crate::wire::{Ipv4Addr, MacAddr};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// State of one in-flight resolution, per the state machine in spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    New,
    Sent,
    Replied,
    RetryPending,
    Resolved,
    TimedOut,
}

enum SlotResult {
    Pending,
    Resolved(MacAddr),
    TimedOut,
}

struct PendingSlot {
    state: Mutex<PendingState>,
    result: Mutex<SlotResult>,
    cv: Condvar,
}

impl PendingSlot {
    fn new() -> Self {
        PendingSlot {
            state: Mutex::new(PendingState::New),
            result: Mutex::new(SlotResult::Pending),
            cv: Condvar::new(),
        }
    }

    fn set_state(&self, s: PendingState) {
        *self.state.lock().unwrap() = s;
    }

    /// Fulfills the slot with `mac` unless it has already settled.
    /// Returns true iff this call was the one that settled it.
    fn fulfill(&self, mac: MacAddr) -> bool {
        let mut result = self.result.lock().unwrap();
        if matches!(*result, SlotResult::Pending) {
            *result = SlotResult::Resolved(mac);
            self.set_state(PendingState::Replied);
            self.cv.notify_all();
            true
        } else {
            false
        }
    }

    fn time_out(&self) {
        let mut result = self.result.lock().unwrap();
        if matches!(*result, SlotResult::Pending) {
            *result = SlotResult::TimedOut;
            self.set_state(PendingState::TimedOut);
            self.cv.notify_all();
        }
    }

    /// Waits up to `timeout` for the slot to settle, returning the result
    /// if it did.
    fn wait(&self, timeout: Duration) -> Option<MacAddr> {
        let result = self.result.lock().unwrap();
        let (result, _) = self
            .cv
            .wait_timeout_while(result, timeout, |r| matches!(r, SlotResult::Pending))
            .unwrap();
        match *result {
            SlotResult::Resolved(mac) => Some(mac),
            _ => None,
        }
    }
}

/// Broadcasts an ARP request frame. Wired by the owning [`Stack`](crate::stack::Stack)
/// to the Ethernet egress path; kept as a trait object so the resolver has
/// no dependency on the concrete transport.
pub trait ArpTransmit: Send + Sync {
    fn send(&self, packet: &ArpPacket);
}

impl<F: Fn(&ArpPacket) + Send + Sync> ArpTransmit for F {
    fn send(&self, packet: &ArpPacket) {
        self(packet)
    }
}

pub struct ArpResolver {
    cache: Arc<ArpCache>,
    pending: Mutex<HashMap<Ipv4Addr, Arc<PendingSlot>>>,
    transmit: Arc<dyn ArpTransmit>,
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    max_retries: u32,
    request_timeout: Duration,
}

impl ArpResolver {
    pub fn new(
        cache: Arc<ArpCache>,
        transmit: Arc<dyn ArpTransmit>,
        local_mac: MacAddr,
        local_ip: Ipv4Addr,
        max_retries: u32,
        request_timeout: Duration,
    ) -> Self {
        ArpResolver {
            cache,
            pending: Mutex::new(HashMap::new()),
            transmit,
            local_mac,
            local_ip,
            max_retries: max_retries.max(1),
            request_timeout,
        }
    }

    /// Resolves `target_ip` to a MAC address, consulting the cache first
    /// and coalescing concurrent resolutions for the same target.
    pub fn resolve(&self, target_ip: Ipv4Addr) -> Result<MacAddr, NetworkError> {
        if let Some(mac) = self.cache.get(target_ip) {
            return Ok(mac);
        }

        let (slot, is_requestor) = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(existing) = pending.get(&target_ip) {
                (existing.clone(), false)
            } else {
                let slot = Arc::new(PendingSlot::new());
                pending.insert(target_ip, slot.clone());
                (slot, true)
            }
        };

        if !is_requestor {
            return self.wait_for_slot(&slot);
        }

        let per_attempt = self.request_timeout / self.max_retries;
        let request = ArpPacket::request(self.local_mac, self.local_ip, target_ip);

        let mut resolved = None;
        for attempt in 0..self.max_retries {
            slot.set_state(PendingState::Sent);
            log::debug!("arp: sending request for {} (attempt {})", target_ip, attempt + 1);
            self.transmit.send(&request);
            if let Some(mac) = slot.wait(per_attempt) {
                resolved = Some(mac);
                break;
            }
            slot.set_state(PendingState::RetryPending);
        }

        self.pending.lock().unwrap().remove(&target_ip);

        match resolved {
            Some(mac) => {
                slot.set_state(PendingState::Resolved);
                self.cache.add(target_ip, mac);
                Ok(mac)
            }
            None => {
                slot.time_out();
                log::warn!("arp: resolution of {} timed out", target_ip);
                Err(NetworkError::ResolutionTimeout)
            }
        }
    }

    fn wait_for_slot(&self, slot: &PendingSlot) -> Result<MacAddr, NetworkError> {
        // A generous upper bound: the requestor enforces the real deadline
        // and always settles the slot (Resolved or TimedOut) before this
        // would otherwise elapse.
        let overall_budget = self.request_timeout + Duration::from_secs(1);
        match slot.wait(overall_budget) {
            Some(mac) => Ok(mac),
            None => Err(NetworkError::ResolutionTimeout),
        }
    }

    /// Broadcasts a gratuitous ARP announcement for our own address.
    pub fn gratuitous_announce(&self) {
        let pkt = ArpPacket::gratuitous(self.local_mac, self.local_ip);
        self.transmit.send(&pkt);
    }

    /// Handles an inbound ARP packet: updates the cache, fulfills any
    /// matching pending resolution, and returns a reply to send back if
    /// the packet was a request targeting our address.
    pub fn handle_incoming(&self, pkt: &ArpPacket) -> Option<ArpPacket> {
        self.cache.add(pkt.sender_ip, pkt.sender_mac);

        if pkt.operation == super::Operation::Reply {
            if let Some(slot) = self.pending.lock().unwrap().get(&pkt.sender_ip).cloned() {
                slot.fulfill(pkt.sender_mac);
            }
        }

        if pkt.operation == super::Operation::Request && pkt.target_ip == self.local_ip {
            return Some(ArpPacket::reply_to(pkt, self.local_mac, self.local_ip));
        }
        None
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolver_with_counter() -> (Arc<ArpResolver>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let transmit: Arc<dyn ArpTransmit> = Arc::new(move |_p: &ArpPacket| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        let resolver = Arc::new(ArpResolver::new(
            Arc::new(ArpCache::new(Duration::from_secs(60))),
            transmit,
            MacAddr::new([1, 2, 3, 4, 5, 6]),
            Ipv4Addr::new([10, 0, 0, 1]),
            3,
            Duration::from_millis(60),
        ));
        (resolver, counter)
    }

    #[test]
    fn resolve_times_out_without_reply() {
        let (resolver, counter) = resolver_with_counter();
        let err = resolver.resolve(Ipv4Addr::new([10, 0, 0, 2])).unwrap_err();
        assert!(matches!(err, NetworkError::ResolutionTimeout));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_resolves_coalesce_into_one_requestor() {
        let (resolver, counter) = resolver_with_counter();
        let target = Ipv4Addr::new([10, 0, 0, 2]);
        let reply_mac = MacAddr::new([9, 9, 9, 9, 9, 9]);

        let r2 = resolver.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            let reply = ArpPacket {
                operation: super::super::Operation::Reply,
                sender_mac: reply_mac,
                sender_ip: target,
                target_mac: MacAddr::new([1, 2, 3, 4, 5, 6]),
                target_ip: Ipv4Addr::new([10, 0, 0, 1]),
            };
            r2.handle_incoming(&reply);
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = resolver.clone();
                std::thread::spawn(move || r.resolve(target))
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), reply_mac);
        }
        // Exactly one request broadcast for the single attempt that succeeds.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_hit_skips_the_network() {
        let (resolver, counter) = resolver_with_counter();
        let ip = Ipv4Addr::new([10, 0, 0, 9]);
        resolver.cache().add(ip, MacAddr::new([7, 7, 7, 7, 7, 7]));
        let mac = resolver.resolve(ip).unwrap();
        assert_eq!(mac, MacAddr::new([7, 7, 7, 7, 7, 7]));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn request_targeting_us_yields_a_reply() {
        let (resolver, _counter) = resolver_with_counter();
        let request = ArpPacket::request(
            MacAddr::new([8, 8, 8, 8, 8, 8]),
            Ipv4Addr::new([10, 0, 0, 5]),
            Ipv4Addr::new([10, 0, 0, 1]),
        );
        let reply = resolver.handle_incoming(&request).unwrap();
        assert_eq!(reply.operation, super::super::Operation::Reply);
        assert_eq!(reply.target_ip, Ipv4Addr::new([10, 0, 0, 5]));
        assert_eq!(reply.sender_ip, Ipv4Addr::new([10, 0, 0, 1]));
    }
}
