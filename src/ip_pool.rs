//! Generic IPv4 allocation primitives shared by the virtual-address CLI
//! default and the fake-IP engine: a monotonic pool with LIFO reuse, and a
//! bidirectional mapping with per-entry expiry.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("address pool for {0} is exhausted")]
    Exhausted(Ipv4Net),
}

/// Allocates IPv4 addresses inside a CIDR, handing out the network address
/// plus one, then plus two, and so on, skipping the network and broadcast
/// addresses. Freed addresses go back onto a LIFO free list and are reused
/// before the monotonic cursor advances further.
pub struct IpPool {
    network: Ipv4Net,
    next: u32,
    last: u32,
    free: Vec<Ipv4Addr>,
}

impl IpPool {
    pub fn new(network: Ipv4Net) -> Self {
        let base = u32::from(network.network());
        let broadcast = u32::from(network.broadcast());
        // Reserve the network and broadcast addresses, and (for anything
        // wider than a /31) the first usable address as the pool's own
        // gateway-ish anchor the way the source's fakeip pool implicitly
        // does by starting allocation one above the network address.
        let first = if broadcast > base + 1 { base + 1 } else { base };
        Self {
            network,
            next: first,
            last: broadcast,
            free: Vec::new(),
        }
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }

    /// Allocate the next free address: LIFO-reused first, else the
    /// monotonic cursor.
    pub fn alloc(&mut self) -> Result<Ipv4Addr, PoolError> {
        if let Some(addr) = self.free.pop() {
            return Ok(addr);
        }
        if self.next >= self.last {
            return Err(PoolError::Exhausted(self.network));
        }
        let addr = Ipv4Addr::from(self.next);
        self.next += 1;
        Ok(addr)
    }

    /// Return an address to the pool for LIFO reuse. The caller must not
    /// call this for an address it did not receive from [`IpPool::alloc`].
    pub fn free(&mut self, addr: Ipv4Addr) {
        debug_assert!(self.contains(addr));
        self.free.push(addr);
    }
}

struct MappingEntry<V> {
    value: V,
    touched_at: Instant,
}

/// A one-directional key→value map with per-entry expiry, refreshed on every
/// successful lookup. Used in pairs (fake→real, real→fake) by the fake-IP
/// engine so both directions share the same expiry clock.
pub struct ExpiringMap<K, V> {
    entries: HashMap<K, MappingEntry<V>>,
    ttl: Duration,
}

impl<K, V> ExpiringMap<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(
            key,
            MappingEntry {
                value,
                touched_at: Instant::now(),
            },
        );
    }

    /// Look up `key`, refreshing its expiry on hit.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.get_mut(key)?;
        entry.touched_at = Instant::now();
        Some(entry.value.clone())
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Remove and return every entry whose last touch is older than this
    /// map's TTL.
    pub fn sweep_expired(&mut self) -> Vec<(K, V)> {
        let ttl = self.ttl;
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.touched_at) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| {
                let v = self.entries.remove(&k)?.value;
                Some((k, v))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_allocates_within_network_and_avoids_broadcast() {
        let net: Ipv4Net = "198.18.0.0/24".parse().unwrap();
        let mut pool = IpPool::new(net);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert!(net.contains(&a) && net.contains(&b));
        assert_ne!(a, net.broadcast());
    }

    #[test]
    fn freed_addresses_are_reused_lifo() {
        let net: Ipv4Net = "198.18.0.0/24".parse().unwrap();
        let mut pool = IpPool::new(net);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        pool.free(b);
        pool.free(a);
        // LIFO: `a` was freed last, so it comes back first.
        assert_eq!(pool.alloc().unwrap(), a);
        assert_eq!(pool.alloc().unwrap(), b);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let net: Ipv4Net = "198.18.0.0/30".parse().unwrap();
        let mut pool = IpPool::new(net);
        // /30 has two usable host addresses after reserving network+broadcast.
        pool.alloc().unwrap();
        pool.alloc().unwrap();
        assert!(pool.alloc().is_err());
    }

    #[test]
    fn expiry_is_refreshed_on_access() {
        let mut map: ExpiringMap<u8, u8> = ExpiringMap::new(Duration::from_millis(20));
        map.insert(1, 100);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(map.get(&1), Some(100));
        std::thread::sleep(Duration::from_millis(15));
        // refreshed at +10ms, so at +25ms from insert it is still alive
        assert_eq!(map.get(&1), Some(100));
    }

    #[test]
    fn sweep_removes_stale_entries_only() {
        let mut map: ExpiringMap<u8, u8> = ExpiringMap::new(Duration::from_millis(10));
        map.insert(1, 100);
        std::thread::sleep(Duration::from_millis(20));
        map.insert(2, 200);
        let expired = map.sweep_expired();
        assert_eq!(expired, vec![(1, 100)]);
        assert_eq!(map.get(&2), Some(200));
    }
}
