use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use weft_switch::PreSharedKey;
use weft_transport::{StarKind, StarServer};
use weft_types::address::parse_multiaddr;
use weft_types::constants::ECHO_PROTOCOL;
use weft_types::identity::{generate_keypair, keypair_from_seed, peer_id_of};
use weft_types::PeerInfo;

use crate::config::NodeConfig;
use crate::echo::echo;
use crate::error::NodeError;
use crate::node::{Node, NodeEvent};
use crate::options::NodeOptions;

#[derive(Parser)]
#[command(name = "weft", about = "weft peer-to-peer switch node", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the node
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "weft.toml")]
        config: String,
        /// Boot node multiaddr to discover (can be specified multiple times)
        #[arg(long = "boot-node")]
        boot_nodes: Vec<String>,
        /// Hex-encoded 32-byte seed for a deterministic identity
        #[arg(long)]
        keypair_seed: Option<String>,
    },
    /// Initialize a new node configuration
    Init {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        dir: String,
    },
    /// Generate a new identity seed and print its peer id
    Keygen,
    /// Print a new private-network swarm key
    SwarmKey,
    /// Run a star rendezvous server
    StarServer {
        /// Socket address to listen on
        #[arg(short, long, default_value = "127.0.0.1:15555")]
        listen: String,
    },
    /// Dial a peer, optionally opening a protocol stream
    Dial {
        /// Multiaddr of the peer
        addr: String,
        /// Protocol to open; echo streams send `--message` and print the reply
        #[arg(short, long)]
        protocol: Option<String>,
        #[arg(short, long, default_value = "hello")]
        message: String,
    },
}

impl Cli {
    /// Log filter used when `RUST_LOG` is unset.
    pub fn log_level(&self) -> String {
        match &self.command {
            Command::Run { config, .. } => NodeConfig::load(config)
                .map(|c| c.logging.level)
                .unwrap_or_else(|_| "info".to_string()),
            _ => "info".to_string(),
        }
    }
}

fn config_error(e: impl std::fmt::Display) -> NodeError {
    NodeError::Config {
        reason: e.to_string(),
    }
}

pub async fn run(cli: Cli) -> Result<(), NodeError> {
    match cli.command {
        Command::Run {
            config,
            boot_nodes,
            keypair_seed,
        } => {
            let mut config = NodeConfig::load(&config)?;
            config.network.boot_nodes.extend(boot_nodes);
            if let Some(seed) = keypair_seed {
                config.identity.keypair_seed = Some(seed);
            }
            run_node(config).await
        }
        Command::Init { dir } => {
            NodeConfig::init(&dir)?;
            info!("Node configuration initialized in {}", dir);
            Ok(())
        }
        Command::Keygen => {
            let seed: [u8; 32] = rand::random();
            let keypair = keypair_from_seed(seed).map_err(config_error)?;
            let out = serde_json::json!({
                "peer_id": peer_id_of(&keypair).to_string(),
                "keypair_seed": hex::encode(seed),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&out).map_err(config_error)?
            );
            Ok(())
        }
        Command::SwarmKey => {
            println!("{}", PreSharedKey::generate());
            Ok(())
        }
        Command::StarServer { listen } => {
            let addr: SocketAddr = listen.parse().map_err(config_error)?;
            let server = StarServer::bind(addr).await.map_err(|e| NodeError::Config {
                reason: format!("failed to bind star server on {}: {}", listen, e),
            })?;
            println!("{}", server.multiaddr(StarKind::WebRtc));
            println!("{}", server.multiaddr(StarKind::WebSocket));
            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal");
            server.shutdown();
            Ok(())
        }
        Command::Dial {
            addr,
            protocol,
            message,
        } => dial(&addr, protocol.as_deref(), &message).await,
    }
}

async fn run_node(config: NodeConfig) -> Result<(), NodeError> {
    let node = Node::new(config.peer_info()?, None, config.to_options()?)?;
    if config.network.echo {
        node.handle(ECHO_PROTOCOL, echo);
    }
    let mut events = node.subscribe();
    node.start().await?;
    for addr in node.peer_info().multiaddrs.iter() {
        info!(addr = %addr, "listening");
    }
    info!(peer_id = %node.peer_id(), "Node is running. Press Ctrl+C to stop.");

    let textfile = config.metrics.textfile.as_deref().map(Path::new);
    let mut metrics_tick =
        tokio::time::interval(Duration::from_secs(config.metrics.interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = metrics_tick.tick() => export_metrics(&node, textfile),
            event = events.recv() => match event {
                Ok(NodeEvent::PeerDiscovery(peer)) => info!(peer_id = %peer.id, "peer discovered"),
                Ok(NodeEvent::PeerConnect(peer)) => info!(peer_id = %peer.id, "peer connected"),
                Ok(NodeEvent::PeerDisconnect(peer)) => info!(peer_id = %peer.id, "peer disconnected"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    node.stop().await;
    export_metrics(&node, textfile);
    info!("Node shutdown complete");
    Ok(())
}

fn export_metrics(node: &Node, textfile: Option<&Path>) {
    let Some(path) = textfile else { return };
    if let Err(e) = node.metrics().write_textfile(path) {
        warn!(path = %path.display(), error = %e, "failed to write metrics");
    }
}

async fn dial(addr: &str, protocol: Option<&str>, message: &str) -> Result<(), NodeError> {
    let target = parse_multiaddr(addr).map_err(config_error)?;
    let keypair = generate_keypair().map_err(config_error)?;
    let options = NodeOptions {
        webrtc_star: true,
        ws_star: true,
        ..NodeOptions::default()
    };
    let node = Node::new(PeerInfo::new(peer_id_of(&keypair)), None, options)?;
    node.start().await?;

    let result = async {
        match protocol {
            None => {
                let conn = node.dial(target).await?;
                println!("connected to {}", conn.remote_peer());
            }
            Some(protocol) => {
                let mut stream = node.dial_protocol(target, protocol).await?;
                println!("opened {} to {}", protocol, stream.remote_peer());
                if protocol == ECHO_PROTOCOL {
                    stream.write_all(message.as_bytes()).await?;
                    stream.shutdown().await?;
                    let mut reply = Vec::new();
                    stream.read_to_end(&mut reply).await?;
                    println!("{}", String::from_utf8_lossy(&reply));
                }
            }
        }
        Ok::<(), NodeError>(())
    }
    .await;

    node.stop().await;
    result
}
