//! Longest-prefix-match routing table and local-interface registry (C4).

use crate::wire::Ipv4Addr;
use std::sync::RwLock;

/// A single routing table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dest: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// `0.0.0.0` means direct delivery: the next hop is the destination.
    pub gateway: Ipv4Addr,
    pub iface: String,
    pub metric: u32,
}

impl Route {
    fn prefix_len(&self) -> u32 {
        self.mask.to_u32().count_ones()
    }

    fn matches(&self, addr: &Ipv4Addr) -> bool {
        addr.matches(&self.dest, &self.mask)
    }
}

/// A known local interface: name plus its assigned address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalInterface {
    pub ip: Ipv4Addr,
}

struct Inner {
    routes: Vec<Route>,
    interfaces: std::collections::HashMap<String, LocalInterface>,
    /// Lookup cache invalidated on every add/remove.
    cache: std::collections::HashMap<Ipv4Addr, (Route, Ipv4Addr)>,
}

/// Thread-safe longest-prefix-match routing table.
pub struct RoutingTable {
    inner: RwLock<Inner>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            inner: RwLock::new(Inner {
                routes: Vec::new(),
                interfaces: std::collections::HashMap::new(),
                cache: std::collections::HashMap::new(),
            }),
        }
    }

    pub fn add_route(&self, route: Route) {
        let mut inner = self.inner.write().unwrap();
        inner.routes.retain(|r| !(r.dest == route.dest && r.mask == route.mask));
        inner.routes.push(route);
        inner.cache.clear();
        log::debug!("routing: route added, cache invalidated");
    }

    pub fn remove_route(&self, dest: Ipv4Addr, mask: Ipv4Addr) {
        let mut inner = self.inner.write().unwrap();
        inner.routes.retain(|r| !(r.dest == dest && r.mask == mask));
        inner.cache.clear();
        log::debug!("routing: route removed, cache invalidated");
    }

    /// Installs (or replaces) the default route, `0.0.0.0/0`.
    pub fn set_default_gateway(&self, gateway: Ipv4Addr, iface: impl Into<String>) {
        self.add_route(Route {
            dest: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            gateway,
            iface: iface.into(),
            metric: u32::MAX,
        });
    }

    pub fn add_local_interface(&self, name: impl Into<String>, ip: Ipv4Addr) {
        let mut inner = self.inner.write().unwrap();
        inner.interfaces.insert(name.into(), LocalInterface { ip });
    }

    pub fn local_interface(&self, name: &str) -> Option<LocalInterface> {
        self.inner.read().unwrap().interfaces.get(name).copied()
    }

    /// Longest-prefix-match lookup. Among routes whose mask matches `dst`,
    /// picks the one with the widest mask (most set bits), breaking ties
    /// by lowest metric. Returns the matched route and the resolved next
    /// hop (`dst` itself for a direct/gateway-`0.0.0.0` route).
    pub fn lookup(&self, dst: Ipv4Addr) -> crate::error::Result<(Route, Ipv4Addr)> {
        {
            let inner = self.inner.read().unwrap();
            if let Some((route, next_hop)) = inner.cache.get(&dst) {
                return Ok((route.clone(), *next_hop));
            }
        }

        let mut inner = self.inner.write().unwrap();
        // Re-check under the write lock in case another writer populated
        // the cache (or invalidated it) between our read and this point.
        if let Some((route, next_hop)) = inner.cache.get(&dst) {
            return Ok((route.clone(), *next_hop));
        }

        let best = inner
            .routes
            .iter()
            .filter(|r| r.matches(&dst))
            .max_by_key(|r| (r.prefix_len(), std::cmp::Reverse(r.metric)))
            .cloned();

        match best {
            Some(route) => {
                let next_hop = if route.gateway.is_unspecified() {
                    dst
                } else {
                    route.gateway
                };
                inner.cache.insert(dst, (route.clone(), next_hop));
                Ok((route, next_hop))
            }
            None => Err(crate::error::NetworkError::NoRoute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dest: [u8; 4], mask: [u8; 4], gw: [u8; 4], iface: &str, metric: u32) -> Route {
        Route {
            dest: Ipv4Addr::new(dest),
            mask: Ipv4Addr::new(mask),
            gateway: Ipv4Addr::new(gw),
            iface: iface.to_string(),
            metric,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        // S4 from spec.md section 8.
        let table = RoutingTable::new();
        table.add_route(route(
            [192, 168, 1, 0],
            [255, 255, 255, 0],
            [0, 0, 0, 0],
            "eth0",
            0,
        ));
        table.add_route(route(
            [192, 168, 1, 128],
            [255, 255, 255, 128],
            [192, 168, 1, 129],
            "eth1",
            0,
        ));

        let (route, next_hop) = table.lookup(Ipv4Addr::new([192, 168, 1, 200])).unwrap();
        assert_eq!(route.iface, "eth1");
        assert_eq!(next_hop, Ipv4Addr::new([192, 168, 1, 129]));
    }

    #[test]
    fn default_route_is_last_resort() {
        let table = RoutingTable::new();
        table.set_default_gateway(Ipv4Addr::new([10, 0, 0, 1]), "eth0");
        table.add_route(route(
            [10, 0, 0, 0],
            [255, 0, 0, 0],
            [0, 0, 0, 0],
            "eth0",
            0,
        ));

        let (r, next_hop) = table.lookup(Ipv4Addr::new([10, 1, 2, 3])).unwrap();
        assert_eq!(r.iface, "eth0");
        assert_eq!(next_hop, Ipv4Addr::new([10, 1, 2, 3]));

        let (r, next_hop) = table.lookup(Ipv4Addr::new([8, 8, 8, 8])).unwrap();
        assert_eq!(r.mask, Ipv4Addr::UNSPECIFIED);
        assert_eq!(next_hop, Ipv4Addr::new([10, 0, 0, 1]));
    }

    #[test]
    fn ties_broken_by_lowest_metric() {
        let table = RoutingTable::new();
        table.add_route(route(
            [192, 168, 1, 0],
            [255, 255, 255, 0],
            [0, 0, 0, 0],
            "eth0",
            10,
        ));
        table.add_route(route(
            [192, 168, 1, 0],
            [255, 255, 255, 0],
            [192, 168, 1, 254],
            "eth1",
            5,
        ));
        let (r, _) = table.lookup(Ipv4Addr::new([192, 168, 1, 50])).unwrap();
        assert_eq!(r.iface, "eth1");
    }

    #[test]
    fn missing_route_is_an_error() {
        let table = RoutingTable::new();
        assert!(table.lookup(Ipv4Addr::new([1, 2, 3, 4])).is_err());
    }

    #[test]
    fn cache_invalidated_on_add() {
        let table = RoutingTable::new();
        table.add_route(route(
            [192, 168, 0, 0],
            [255, 255, 0, 0],
            [0, 0, 0, 0],
            "eth0",
            0,
        ));
        let dst = Ipv4Addr::new([192, 168, 5, 5]);
        assert_eq!(table.lookup(dst).unwrap().0.iface, "eth0");

        table.add_route(route(
            [192, 168, 5, 0],
            [255, 255, 255, 0],
            [192, 168, 5, 1],
            "eth1",
            0,
        ));
        assert_eq!(table.lookup(dst).unwrap().0.iface, "eth1");
    }
}
