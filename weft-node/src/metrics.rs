use std::path::Path;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::error::NodeError;

/// Node-wide Prometheus metrics.
#[derive(Debug)]
pub struct NodeMetrics {
    pub peer_count: Gauge,
    pub dials: Counter,
    pub dial_failures: Counter,
    pub discovered_peers: Counter,
    pub registry: Registry,
}

impl NodeMetrics {
    /// Create a new metrics registry with all node metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let peer_count = Gauge::default();
        let dials = Counter::default();
        let dial_failures = Counter::default();
        let discovered_peers = Counter::default();

        registry.register(
            "weft_peer_count",
            "Number of peers with an open connection",
            peer_count.clone(),
        );
        registry.register("weft_dials", "Dials requested", dials.clone());
        registry.register(
            "weft_dial_failures",
            "Dials that failed",
            dial_failures.clone(),
        );
        registry.register(
            "weft_discovered_peers",
            "Peers reported by discovery services",
            discovered_peers.clone(),
        );

        Self {
            peer_count,
            dials,
            dial_failures,
            discovered_peers,
            registry,
        }
    }

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }

    /// Replace `path` with the current exposition, for a textfile collector.
    pub fn write_textfile(&self, path: &Path) -> Result<(), NodeError> {
        let text = self.encode().map_err(|e| NodeError::Config {
            reason: format!("failed to encode metrics: {}", e),
        })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = NodeMetrics::new();
        metrics.peer_count.set(5);
        metrics.dials.inc();
        metrics.dials.inc();

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("weft_peer_count"));
        assert!(encoded.contains("weft_dials_total 2"));
        assert!(encoded.contains("weft_dial_failures_total"));
        assert!(encoded.contains("weft_discovered_peers_total"));
    }

    #[test]
    fn test_metrics_encode_format() {
        let metrics = NodeMetrics::new();
        metrics.peer_count.set(100);
        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("weft_peer_count 100"));
    }

    #[test]
    fn test_write_textfile() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("weft.prom");
        let metrics = NodeMetrics::new();
        metrics.discovered_peers.inc();
        metrics.write_textfile(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("weft_discovered_peers_total 1"));
        assert!(!tmp.path().join("weft.tmp").exists());
    }
}
