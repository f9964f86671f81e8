//! The CIDR route table: the router's single source of truth for
//! network → next-hop mappings.
//!
//! Implemented as a flat, per-prefix-length bucket map rather than a pointer
//! trie — with overlay networks rarely holding more than a few thousand
//! routes, scanning prefix lengths 32 down to 0 and doing an exact-network
//! hash lookup at each is simple, cache-friendly, and gives the same
//! asymptotics a Patricia trie would for this table's size. Longest-prefix
//! match and "all entries inside a network" are both expressed in terms of
//! this bucket layout.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use ipnet::Ipv4Net;

use crate::router::port::PortId;

/// A stored route: who owns it, how far away it is, and when it was last
/// refreshed by an incoming Register.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub network: Ipv4Net,
    pub port: PortId,
    pub metric: u16,
    pub rtt: u32,
    pub origin: String,
    pub updated_at: Instant,
}

#[derive(Default)]
pub struct RouteTable {
    /// Bucketed by prefix length so longest-prefix match only has to probe
    /// at most 33 hash lookups per packet.
    buckets: [HashMap<Ipv4Net, StoredEntry>; 33],
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| HashMap::new()),
        }
    }

    fn bucket(&self, prefix_len: u8) -> &HashMap<Ipv4Net, StoredEntry> {
        &self.buckets[prefix_len as usize]
    }

    fn bucket_mut(&mut self, prefix_len: u8) -> &mut HashMap<Ipv4Net, StoredEntry> {
        &mut self.buckets[prefix_len as usize]
    }

    /// The one stored entry for this exact network, if any. Used by
    /// `update_routing` to find a possible conflicting or adoptable
    /// candidate.
    pub fn exact(&self, network: Ipv4Net) -> Option<&StoredEntry> {
        self.bucket(network.prefix_len()).get(&network)
    }

    pub fn insert(&mut self, entry: StoredEntry) {
        self.bucket_mut(entry.network.prefix_len())
            .insert(entry.network, entry);
    }

    pub fn remove(&mut self, network: Ipv4Net) -> Option<StoredEntry> {
        self.bucket_mut(network.prefix_len()).remove(&network)
    }

    /// Longest-prefix match: the most specific stored entry whose network
    /// covers `dst`. Ties (impossible for distinct networks of the same
    /// prefix length since they'd be the same key) are broken by
    /// insertion order, which a `HashMap` does not track; in practice two
    /// entries never share both network and prefix length, so this never
    /// arises.
    pub fn longest_match(&self, dst: Ipv4Addr) -> Option<&StoredEntry> {
        for prefix_len in (0..=32u8).rev() {
            for entry in self.bucket(prefix_len).values() {
                if entry.network.contains(&dst) {
                    return Some(entry);
                }
            }
        }
        None
    }

    /// All stored entries whose network lies inside `supernet` (inclusive).
    pub fn covered_by(&self, supernet: Ipv4Net) -> Vec<&StoredEntry> {
        self.iter()
            .filter(|e| supernet.contains(&e.network.network()) && e.network.prefix_len() >= supernet.prefix_len())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredEntry> {
        self.buckets.iter().flat_map(|b| b.values())
    }

    /// Remove every entry belonging to `port`. Used when a port closes.
    pub fn remove_port(&mut self, port: PortId) -> Vec<StoredEntry> {
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            let dead: Vec<Ipv4Net> = bucket
                .iter()
                .filter(|(_, e)| e.port == port)
                .map(|(k, _)| *k)
                .collect();
            for network in dead {
                if let Some(entry) = bucket.remove(&network) {
                    removed.push(entry);
                }
            }
        }
        removed
    }

    /// Remove every entry whose `updated_at` is older than `max_age`,
    /// returning them for the caller to log/clean up.
    pub fn sweep_stale(&mut self, max_age: std::time::Duration) -> Vec<StoredEntry> {
        let now = Instant::now();
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            let stale: Vec<Ipv4Net> = bucket
                .iter()
                .filter(|(_, e)| now.duration_since(e.updated_at) > max_age)
                .map(|(k, _)| *k)
                .collect();
            for network in stale {
                if let Some(entry) = bucket.remove(&network) {
                    removed.push(entry);
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::port::PortId;

    fn entry(network: &str, port: PortId, metric: u16, origin: &str) -> StoredEntry {
        StoredEntry {
            network: network.parse().unwrap(),
            port,
            metric,
            rtt: 0,
            origin: origin.into(),
            updated_at: Instant::now(),
        }
    }

    #[test]
    fn longest_prefix_wins_over_shorter_supernet() {
        let mut table = RouteTable::new();
        let p1 = PortId::for_test(1);
        let p2 = PortId::for_test(2);
        table.insert(entry("10.0.0.0/8", p1, 1, "a"));
        table.insert(entry("10.0.0.0/24", p2, 1, "a"));

        let hit = table.longest_match("10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(hit.port, p2);
        assert_eq!(hit.network, "10.0.0.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn no_match_outside_any_network() {
        let mut table = RouteTable::new();
        table.insert(entry("10.0.0.0/24", PortId::for_test(1), 1, "a"));
        assert!(table.longest_match("192.168.1.1".parse().unwrap()).is_none());
    }

    #[test]
    fn remove_port_drops_only_its_routes() {
        let mut table = RouteTable::new();
        let p1 = PortId::for_test(1);
        let p2 = PortId::for_test(2);
        table.insert(entry("10.0.0.0/24", p1, 1, "a"));
        table.insert(entry("10.0.1.0/24", p2, 1, "b"));
        let removed = table.remove_port(p1);
        assert_eq!(removed.len(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.exact("10.0.1.0/24".parse().unwrap()).is_some());
    }

    #[test]
    fn covered_by_includes_only_contained_entries() {
        let mut table = RouteTable::new();
        table.insert(entry("10.0.0.0/24", PortId::for_test(1), 1, "a"));
        table.insert(entry("172.16.0.0/24", PortId::for_test(2), 1, "b"));
        let covered = table.covered_by("10.0.0.0/8".parse().unwrap());
        assert_eq!(covered.len(), 1);
        assert_eq!(covered[0].network, "10.0.0.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn sweep_stale_removes_old_entries() {
        let mut table = RouteTable::new();
        let mut old = entry("10.0.0.0/24", PortId::for_test(1), 1, "a");
        old.updated_at = Instant::now() - std::time::Duration::from_secs(120);
        table.insert(old);
        table.insert(entry("10.0.1.0/24", PortId::for_test(2), 1, "b"));

        let removed = table.sweep_stale(std::time::Duration::from_secs(90));
        assert_eq!(removed.len(), 1);
        assert_eq!(table.len(), 1);
    }
}
