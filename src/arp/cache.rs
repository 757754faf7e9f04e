//! IPv4 → MAC cache with expiring entries.

use crate::wire::{Ipv4Addr, MacAddr};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry {
    mac: MacAddr,
    expires_at: Instant,
}

/// Thread-safe ARP cache: exclusive writers, concurrent readers.
pub struct ArpCache {
    ttl: Duration,
    entries: RwLock<HashMap<Ipv4Addr, Entry>>,
}

impl ArpCache {
    pub fn new(ttl: Duration) -> Self {
        ArpCache {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or replaces the binding for `ip`.
    pub fn add(&self, ip: Ipv4Addr, mac: MacAddr) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.write().unwrap().insert(ip, Entry { mac, expires_at });
    }

    /// Returns the MAC for `ip` unless absent or expired.
    pub fn get(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&ip)?;
        if entry.expires_at <= Instant::now() {
            None
        } else {
            Some(entry.mac)
        }
    }

    pub fn delete(&self, ip: Ipv4Addr) {
        self.entries.write().unwrap().remove(&ip);
    }

    /// Reclaims expired entries, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// A consistent snapshot of unexpired bindings at the moment of the call.
    pub fn snapshot(&self) -> Vec<(Ipv4Addr, MacAddr)> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(ip, e)| (*ip, e.mac))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get() {
        let cache = ArpCache::new(Duration::from_secs(60));
        let ip = Ipv4Addr::new([10, 0, 0, 1]);
        let mac = MacAddr::new([1, 2, 3, 4, 5, 6]);
        cache.add(ip, mac);
        assert_eq!(cache.get(ip), Some(mac));
    }

    #[test]
    fn expired_entries_are_invisible() {
        let cache = ArpCache::new(Duration::from_millis(1));
        let ip = Ipv4Addr::new([10, 0, 0, 1]);
        cache.add(ip, MacAddr::new([1, 2, 3, 4, 5, 6]));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(ip), None);
    }

    #[test]
    fn add_replaces_prior_binding() {
        let cache = ArpCache::new(Duration::from_secs(60));
        let ip = Ipv4Addr::new([10, 0, 0, 1]);
        cache.add(ip, MacAddr::new([1, 1, 1, 1, 1, 1]));
        cache.add(ip, MacAddr::new([2, 2, 2, 2, 2, 2]));
        assert_eq!(cache.get(ip), Some(MacAddr::new([2, 2, 2, 2, 2, 2])));
    }

    #[test]
    fn cleanup_reclaims_only_expired() {
        let cache = ArpCache::new(Duration::from_millis(1));
        cache.add(Ipv4Addr::new([10, 0, 0, 1]), MacAddr::new([1, 1, 1, 1, 1, 1]));
        std::thread::sleep(Duration::from_millis(20));
        cache.add(Ipv4Addr::new([10, 0, 0, 2]), MacAddr::new([2, 2, 2, 2, 2, 2]));
        let reclaimed = cache.cleanup();
        assert_eq!(reclaimed, 1);
        assert_eq!(cache.snapshot().len(), 1);
    }
}
