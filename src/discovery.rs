//! The discovery/namespace seam (§1, §10.5): the real rendezvous and
//! peer-rating subsystem is out of scope, but `-n`/`-b`/`-private` need to be
//! meaningful CLI flags rather than dead ones, so a trait exists for a real
//! implementation to slot into later.

/// Resolves which endpoints to dial beyond the ones the operator listed
/// explicitly with `-e`. The reference implementation is a no-op: it just
/// returns the configured bootstrap list verbatim. A namespace-aware
/// rendezvous server, peer rating, and NAT-traversal hinting would live
/// behind a second implementation of this trait without touching the
/// connector or router.
pub trait PeerDiscovery: Send + Sync {
    /// Endpoints to dial in addition to `-e`, resolved once at startup.
    fn bootstrap_endpoints(&self) -> Vec<String>;

    /// The discovery namespace this node announces itself under (`-n`).
    fn namespace(&self) -> &str;

    /// `true` if peering should be restricted to nodes in the same
    /// namespace (`-private`). The stub never rejects a dial on this basis;
    /// a real discovery backend would use it to filter candidates before
    /// they ever reach the connector.
    fn private(&self) -> bool;
}

/// The reference `PeerDiscovery`: returns exactly the bootstrap list it was
/// constructed with, performing no rendezvous of its own.
pub struct StaticDiscovery {
    namespace: String,
    bootstrap: Vec<String>,
    private: bool,
}

impl StaticDiscovery {
    pub fn new(namespace: impl Into<String>, bootstrap: Vec<String>, private: bool) -> Self {
        Self {
            namespace: namespace.into(),
            bootstrap,
            private,
        }
    }
}

impl PeerDiscovery for StaticDiscovery {
    fn bootstrap_endpoints(&self) -> Vec<String> {
        self.bootstrap.clone()
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn private(&self) -> bool {
        self.private
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_bootstrap_list_verbatim() {
        let discovery = StaticDiscovery::new("my-ns", vec!["ipfs/abc".into()], false);
        assert_eq!(discovery.bootstrap_endpoints(), vec!["ipfs/abc".to_string()]);
        assert_eq!(discovery.namespace(), "my-ns");
        assert!(!discovery.private());
    }
}
