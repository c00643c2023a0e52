use std::sync::Arc;

use weft_switch::{MplexMuxer, Protector, StreamMuxer, SwitchConfig, Transport};
use weft_transport::MemoryHub;
use weft_types::constants::MPLEX_PROTOCOL;

use crate::error::NodeError;

/// How a [`Node`](crate::Node) is assembled.
///
/// Defaults: mplex as the only muxer, TCP on, star transports off, no
/// memory hub, no protector, private network not enforced, no bootstrap
/// peers, no auto-dial, default switch tuning.
#[derive(Clone)]
pub struct NodeOptions {
    /// Stream muxers to offer, in preference order. Only `"mplex"` is built in.
    pub muxers: Vec<String>,
    pub tcp: bool,
    pub webrtc_star: bool,
    pub ws_star: bool,
    /// Enables the in-process transport on this hub.
    pub memory_hub: Option<MemoryHub>,
    /// Additional transports, registered after the built-in ones.
    pub transports: Vec<Arc<dyn Transport>>,
    pub protector: Option<Arc<dyn Protector>>,
    /// Refuse to build a node without a protector.
    pub force_private_network: bool,
    /// Boot peer multiaddrs, each ending in `/p2p/<id>`.
    pub bootstrap: Vec<String>,
    /// Dial every discovered peer.
    pub auto_dial: bool,
    pub switch: SwitchConfig,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            muxers: vec!["mplex".to_string()],
            tcp: true,
            webrtc_star: false,
            ws_star: false,
            memory_hub: None,
            transports: Vec::new(),
            protector: None,
            force_private_network: false,
            bootstrap: Vec::new(),
            auto_dial: false,
            switch: SwitchConfig::default(),
        }
    }
}

impl NodeOptions {
    /// Options for a node that only talks over `hub`.
    pub fn memory(hub: MemoryHub) -> Self {
        Self {
            tcp: false,
            memory_hub: Some(hub),
            ..Self::default()
        }
    }
}

/// Look up a built-in muxer by name or protocol id.
pub fn muxer_by_name(name: &str) -> Result<Arc<dyn StreamMuxer>, NodeError> {
    match name {
        "mplex" | MPLEX_PROTOCOL => Ok(Arc::new(MplexMuxer)),
        other => Err(NodeError::Config {
            reason: format!("unknown stream muxer '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = NodeOptions::default();
        assert_eq!(options.muxers, vec!["mplex".to_string()]);
        assert!(options.tcp);
        assert!(!options.webrtc_star);
        assert!(!options.ws_star);
        assert!(options.protector.is_none());
        assert!(!options.force_private_network);
        assert!(!options.auto_dial);
    }

    #[test]
    fn test_muxer_by_name() {
        assert_eq!(muxer_by_name("mplex").unwrap().protocol(), MPLEX_PROTOCOL);
        assert_eq!(muxer_by_name(MPLEX_PROTOCOL).unwrap().protocol(), MPLEX_PROTOCOL);
        assert!(matches!(
            muxer_by_name("spdy"),
            Err(NodeError::Config { .. })
        ));
    }
}
