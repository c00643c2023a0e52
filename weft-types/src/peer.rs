use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};

use crate::address::peer_id_of;

// ─── MultiaddrSet ────────────────────────────────────────────────────────────

/// An insertion-ordered set of multiaddrs.
///
/// Dial attempts walk the addresses in the order they were learned, so the set
/// keeps that order instead of hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiaddrSet {
    addrs: Vec<Multiaddr>,
}

impl MultiaddrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address. Returns `false` if it was already present.
    pub fn add(&mut self, addr: Multiaddr) -> bool {
        if self.addrs.contains(&addr) {
            return false;
        }
        self.addrs.push(addr);
        true
    }

    /// Remove an address. Returns `true` if it was present.
    pub fn remove(&mut self, addr: &Multiaddr) -> bool {
        let before = self.addrs.len();
        self.addrs.retain(|a| a != addr);
        self.addrs.len() != before
    }

    /// Replace the whole set, keeping the given order and dropping duplicates.
    pub fn replace(&mut self, addrs: impl IntoIterator<Item = Multiaddr>) {
        self.addrs.clear();
        for addr in addrs {
            self.add(addr);
        }
    }

    pub fn contains(&self, addr: &Multiaddr) -> bool {
        self.addrs.contains(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Multiaddr> {
        self.addrs.iter()
    }

    pub fn to_vec(&self) -> Vec<Multiaddr> {
        self.addrs.clone()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl Extend<Multiaddr> for MultiaddrSet {
    fn extend<I: IntoIterator<Item = Multiaddr>>(&mut self, iter: I) {
        for addr in iter {
            self.add(addr);
        }
    }
}

impl FromIterator<Multiaddr> for MultiaddrSet {
    fn from_iter<I: IntoIterator<Item = Multiaddr>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl<'a> IntoIterator for &'a MultiaddrSet {
    type Item = &'a Multiaddr;
    type IntoIter = std::slice::Iter<'a, Multiaddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.iter()
    }
}

// ─── PeerInfo ────────────────────────────────────────────────────────────────

/// Everything known about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Candidate addresses, in the order they were learned.
    pub multiaddrs: MultiaddrSet,
    /// Protocols the peer is known to speak.
    pub protocols: BTreeSet<String>,
    /// Last measured round-trip latency, if any.
    pub latency: Option<Duration>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            multiaddrs: MultiaddrSet::new(),
            protocols: BTreeSet::new(),
            latency: None,
        }
    }

    /// Builder-style address insertion.
    pub fn with_addr(mut self, addr: Multiaddr) -> Self {
        self.multiaddrs.add(addr);
        self
    }

    /// Builder-style protocol insertion.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.insert(protocol.into());
        self
    }

    pub fn supports(&self, protocol: &str) -> bool {
        self.protocols.contains(protocol)
    }

    /// Fold another record for the same peer into this one.
    ///
    /// Addresses and protocols are unioned; a known latency replaces the
    /// current one.
    pub fn merge(&mut self, other: &PeerInfo) {
        debug_assert_eq!(self.id, other.id, "merging records of different peers");
        self.multiaddrs.extend(other.multiaddrs.iter().cloned());
        self.protocols.extend(other.protocols.iter().cloned());
        if other.latency.is_some() {
            self.latency = other.latency;
        }
    }
}

// ─── DialTarget ──────────────────────────────────────────────────────────────

/// What a dial, dial-protocol, or hang-up call refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// A full peer record; its addresses are merged into the peer book first.
    Peer(PeerInfo),
    /// A single address, usually ending in `/p2p/<id>`.
    Addr(Multiaddr),
    /// A bare peer id, resolved through the peer book.
    Id(PeerId),
}

impl DialTarget {
    /// The peer this target names, if it names one.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            DialTarget::Peer(info) => Some(info.id),
            DialTarget::Addr(addr) => peer_id_of(addr),
            DialTarget::Id(id) => Some(*id),
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Peer(info) => write!(f, "{}", info.id),
            DialTarget::Addr(addr) => write!(f, "{}", addr),
            DialTarget::Id(id) => write!(f, "{}", id),
        }
    }
}

impl From<PeerInfo> for DialTarget {
    fn from(info: PeerInfo) -> Self {
        DialTarget::Peer(info)
    }
}

impl From<&PeerInfo> for DialTarget {
    fn from(info: &PeerInfo) -> Self {
        DialTarget::Peer(info.clone())
    }
}

impl From<Multiaddr> for DialTarget {
    fn from(addr: Multiaddr) -> Self {
        DialTarget::Addr(addr)
    }
}

impl From<&Multiaddr> for DialTarget {
    fn from(addr: &Multiaddr) -> Self {
        DialTarget::Addr(addr.clone())
    }
}

impl From<PeerId> for DialTarget {
    fn from(id: PeerId) -> Self {
        DialTarget::Id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::with_peer_id;
    use crate::identity::{keypair_from_seed, peer_id_of as key_peer_id};

    fn peer(seed: u8) -> PeerId {
        key_peer_id(&keypair_from_seed([seed; 32]).unwrap())
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_multiaddr_set_dedups_and_keeps_order() {
        let mut set = MultiaddrSet::new();
        assert!(set.add(addr("/memory/2")));
        assert!(set.add(addr("/memory/1")));
        assert!(!set.add(addr("/memory/2")));
        let order: Vec<String> = set.iter().map(|a| a.to_string()).collect();
        assert_eq!(order, vec!["/memory/2", "/memory/1"]);
    }

    #[test]
    fn test_multiaddr_set_remove_and_replace() {
        let mut set: MultiaddrSet = vec![addr("/memory/1"), addr("/memory/2")]
            .into_iter()
            .collect();
        assert!(set.remove(&addr("/memory/1")));
        assert!(!set.remove(&addr("/memory/1")));
        set.replace(vec![addr("/memory/3"), addr("/memory/3")]);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&addr("/memory/3")));
    }

    #[test]
    fn test_peer_info_merge_unions() {
        let id = peer(1);
        let mut a = PeerInfo::new(id)
            .with_addr(addr("/memory/1"))
            .with_protocol("/echo/1.0.0");
        let mut b = PeerInfo::new(id)
            .with_addr(addr("/memory/1"))
            .with_addr(addr("/memory/2"))
            .with_protocol("/chat/1.0.0");
        b.latency = Some(Duration::from_millis(12));

        a.merge(&b);
        assert_eq!(a.multiaddrs.len(), 2);
        assert!(a.supports("/echo/1.0.0"));
        assert!(a.supports("/chat/1.0.0"));
        assert_eq!(a.latency, Some(Duration::from_millis(12)));
    }

    #[test]
    fn test_merge_keeps_latency_when_other_unknown() {
        let id = peer(2);
        let mut a = PeerInfo::new(id);
        a.latency = Some(Duration::from_millis(5));
        a.merge(&PeerInfo::new(id));
        assert_eq!(a.latency, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_dial_target_peer_id() {
        let id = peer(3);
        assert_eq!(DialTarget::from(id).peer_id(), Some(id));
        assert_eq!(DialTarget::from(PeerInfo::new(id)).peer_id(), Some(id));
        let full = with_peer_id(&addr("/memory/7"), id);
        assert_eq!(DialTarget::from(&full).peer_id(), Some(id));
        assert_eq!(DialTarget::from(addr("/memory/7")).peer_id(), None);
    }
}
