use async_trait::async_trait;
use weft_switch::{Discovery, DiscoverySink, SwitchError};
use weft_types::address::peer_id_of;
use weft_types::{Multiaddr, PeerInfo};

/// Reports a fixed list of boot peers once started.
pub struct Bootstrap {
    peers: Vec<PeerInfo>,
}

impl Bootstrap {
    /// Create from a list of multiaddr strings.
    /// Invalid strings and addresses without a `/p2p/` id are logged and skipped.
    pub fn new(boot_nodes: &[String]) -> Self {
        let peers = boot_nodes
            .iter()
            .filter_map(|s| {
                let addr = s
                    .parse::<Multiaddr>()
                    .map_err(|e| {
                        tracing::warn!("Invalid multiaddr '{}': {}", s, e);
                        e
                    })
                    .ok()?;
                match peer_id_of(&addr) {
                    Some(id) => Some(PeerInfo::new(id).with_addr(addr)),
                    None => {
                        tracing::warn!("Boot node '{}' has no /p2p/ peer id, skipping", s);
                        None
                    }
                }
            })
            .collect();

        Self { peers }
    }

    /// The parsed boot peers.
    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }
}

#[async_trait]
impl Discovery for Bootstrap {
    fn tag(&self) -> &'static str {
        "bootstrap"
    }

    async fn start(&self, sink: DiscoverySink) -> Result<(), SwitchError> {
        for peer in &self.peers {
            let _ = sink.send(peer.clone());
        }
        Ok(())
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use weft_types::identity::{keypair_from_seed, peer_id_of as key_peer_id};

    fn boot_addr() -> String {
        let id = key_peer_id(&keypair_from_seed([1; 32]).unwrap());
        format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", id)
    }

    #[test]
    fn test_parse_valid_multiaddr() {
        let disc = Bootstrap::new(&[boot_addr()]);
        assert_eq!(disc.peers().len(), 1);
    }

    #[test]
    fn test_parse_invalid_multiaddr() {
        let disc = Bootstrap::new(&["not-a-multiaddr".to_string()]);
        assert!(disc.peers().is_empty());
    }

    #[test]
    fn test_skip_address_without_peer_id() {
        let disc = Bootstrap::new(&["/ip4/127.0.0.1/tcp/4001".to_string()]);
        assert!(disc.peers().is_empty());
    }

    #[tokio::test]
    async fn test_start_reports_every_peer() {
        let disc = Bootstrap::new(&[boot_addr()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        disc.start(tx).await.unwrap();
        let info = rx.recv().await.unwrap();
        assert_eq!(info.multiaddrs.len(), 1);
        assert_eq!(info.multiaddrs.to_vec()[0].to_string(), boot_addr());
    }
}
