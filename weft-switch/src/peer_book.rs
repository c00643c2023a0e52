use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use weft_types::{Multiaddr, PeerId, PeerInfo};

/// Shared registry of known peers.
///
/// Cloning is cheap; every clone sees the same records. A peer id appears at
/// most once, and `put` merges instead of overwriting.
#[derive(Debug, Clone, Default)]
pub struct PeerBook {
    peers: Arc<RwLock<HashMap<PeerId, PeerInfo>>>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a record. Returns the stored (merged) record.
    pub fn put(&self, info: PeerInfo) -> PeerInfo {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(&info.id) {
            Some(existing) => {
                existing.merge(&info);
                existing.clone()
            }
            None => {
                peers.insert(info.id, info.clone());
                info
            }
        }
    }

    /// Add one address to a peer, creating the record if needed.
    pub fn add_addr(&self, peer: PeerId, addr: Multiaddr) -> PeerInfo {
        self.put(PeerInfo::new(peer).with_addr(addr))
    }

    /// Record that a peer speaks a protocol.
    pub fn add_protocol(&self, peer: PeerId, protocol: &str) -> PeerInfo {
        self.put(PeerInfo::new(peer).with_protocol(protocol))
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }

    /// Snapshot of every record.
    pub fn get_all(&self) -> HashMap<PeerId, PeerInfo> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn has(&self, peer: &PeerId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(peer)
    }

    pub fn remove(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use weft_types::identity::{keypair_from_seed, peer_id_of};

    fn peer(seed: u8) -> PeerId {
        peer_id_of(&keypair_from_seed([seed; 32]).unwrap())
    }

    fn addr(port: u64) -> Multiaddr {
        format!("/memory/{}", port).parse().unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let book = PeerBook::new();
        let id = peer(1);
        book.put(PeerInfo::new(id).with_addr(addr(1)));
        let info = book.get(&id).unwrap();
        assert_eq!(info.multiaddrs.len(), 1);
        assert!(book.has(&id));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_put_merges() {
        let book = PeerBook::new();
        let id = peer(1);
        book.put(PeerInfo::new(id).with_addr(addr(1)));
        let merged = book.put(PeerInfo::new(id).with_addr(addr(2)).with_protocol("/echo/1.0.0"));
        assert_eq!(merged.multiaddrs.len(), 2);
        assert!(merged.supports("/echo/1.0.0"));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let book = PeerBook::new();
        assert!(book.get(&peer(9)).is_none());
        assert!(!book.has(&peer(9)));
    }

    #[test]
    fn test_remove() {
        let book = PeerBook::new();
        let id = peer(1);
        book.add_addr(id, addr(1));
        assert!(book.remove(&id).is_some());
        assert!(book.remove(&id).is_none());
        assert!(book.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let book = PeerBook::new();
        let other = book.clone();
        other.add_protocol(peer(4), "/x/1");
        assert!(book.has(&peer(4)));
    }

    proptest! {
        #[test]
        fn prop_one_record_per_peer(ops in proptest::collection::vec((0u8..4, 0u64..8), 0..64)) {
            let book = PeerBook::new();
            for (seed, port) in &ops {
                book.add_addr(peer(*seed + 1), addr(*port));
            }
            let distinct: std::collections::HashSet<u8> = ops.iter().map(|(s, _)| *s).collect();
            prop_assert_eq!(book.len(), distinct.len());
            for (seed, port) in &ops {
                let info = book.get(&peer(*seed + 1)).unwrap();
                prop_assert!(info.multiaddrs.contains(&addr(*port)));
            }
        }
    }
}
