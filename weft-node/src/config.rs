use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use weft_switch::{PreSharedKey, PreSharedKeyProtector, Protector, SwitchConfig};
use weft_types::address::parse_multiaddr;
use weft_types::constants::DEFAULT_EVENT_CAPACITY;
use weft_types::identity::{generate_keypair, keypair_from_hex, peer_id_of};
use weft_types::PeerInfo;

use crate::error::NodeError;
use crate::options::NodeOptions;

/// Name of the file written by [`NodeConfig::init`].
pub const CONFIG_FILE_NAME: &str = "weft.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transports: TransportsConfig,
    #[serde(default)]
    pub pnet: PnetConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded 32-byte seed. A fresh identity is generated when absent.
    pub keypair_seed: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_addrs: Vec<String>,
    pub boot_nodes: Vec<String>,
    /// Dial every discovered peer.
    #[serde(default)]
    pub auto_dial: bool,
    /// Serve `/echo/1.0.0`.
    #[serde(default = "default_echo")]
    pub echo: bool,
    pub dial_timeout_secs: u64,
    pub negotiation_timeout_secs: u64,
}

fn default_echo() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportsConfig {
    pub muxers: Vec<String>,
    pub tcp: bool,
    pub webrtc_star: bool,
    pub ws_star: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PnetConfig {
    /// Refuse to start without a swarm key.
    pub enforce: bool,
    /// Path to a swarm key file (`/key/swarm/psk/1.0.0/` format).
    pub swarm_key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// File rewritten with the Prometheus text exposition every interval.
    pub textfile: Option<String>,
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            textfile: None,
            interval_secs: 15,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig {
                listen_addrs: vec!["/ip4/0.0.0.0/tcp/4001".to_string()],
                boot_nodes: Vec::new(),
                auto_dial: false,
                echo: true,
                dial_timeout_secs: 30,
                negotiation_timeout_secs: 10,
            },
            transports: TransportsConfig {
                muxers: vec!["mplex".to_string()],
                tcp: true,
                webrtc_star: false,
                ws_star: false,
            },
            pnet: PnetConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            metrics: MetricsConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, NodeError> {
        let contents = std::fs::read_to_string(path).map_err(|e| NodeError::Config {
            reason: format!("failed to read config file '{}': {}", path, e),
        })?;
        let config: NodeConfig = toml::from_str(&contents).map_err(|e| NodeError::Config {
            reason: format!("failed to parse config file '{}': {}", path, e),
        })?;
        Ok(config)
    }

    /// Initialize a default configuration file in the given directory.
    pub fn init(dir: &str) -> Result<(), NodeError> {
        let dir_path = Path::new(dir);
        if !dir_path.exists() {
            std::fs::create_dir_all(dir_path)?;
        }

        let config = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&config).map_err(|e| NodeError::Config {
            reason: format!("failed to serialize default config: {}", e),
        })?;

        let config_path = dir_path.join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, toml_str)?;

        Ok(())
    }

    /// Our identity and listen addresses.
    pub fn peer_info(&self) -> Result<PeerInfo, NodeError> {
        let keypair = match &self.identity.keypair_seed {
            Some(seed) => keypair_from_hex(seed),
            None => generate_keypair(),
        }
        .map_err(|e| NodeError::Config {
            reason: e.to_string(),
        })?;

        let mut info = PeerInfo::new(peer_id_of(&keypair));
        for addr in &self.network.listen_addrs {
            let addr = parse_multiaddr(addr).map_err(|e| NodeError::Config {
                reason: e.to_string(),
            })?;
            info.multiaddrs.add(addr);
        }
        Ok(info)
    }

    /// Build node options, reading the swarm key when one is configured.
    pub fn to_options(&self) -> Result<NodeOptions, NodeError> {
        let protector: Option<Arc<dyn Protector>> = match &self.pnet.swarm_key_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| NodeError::Config {
                    reason: format!("failed to read swarm key '{}': {}", path, e),
                })?;
                let key: PreSharedKey = contents.parse()?;
                tracing::info!(fingerprint = %key.fingerprint(), "private network enabled");
                Some(Arc::new(PreSharedKeyProtector::new(key)))
            }
            None => None,
        };

        Ok(NodeOptions {
            muxers: self.transports.muxers.clone(),
            tcp: self.transports.tcp,
            webrtc_star: self.transports.webrtc_star,
            ws_star: self.transports.ws_star,
            memory_hub: None,
            transports: Vec::new(),
            protector,
            force_private_network: self.pnet.enforce,
            bootstrap: self.network.boot_nodes.clone(),
            auto_dial: self.network.auto_dial,
            switch: SwitchConfig {
                dial_timeout: Duration::from_secs(self.network.dial_timeout_secs),
                negotiation_timeout: Duration::from_secs(self.network.negotiation_timeout_secs),
                event_capacity: DEFAULT_EVENT_CAPACITY,
            },
        })
    }
}
