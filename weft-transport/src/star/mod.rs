//! Star transports: peers join a rendezvous server, learn about each other
//! through it, and reach each other over connections it splices together.

pub mod message;
pub mod server;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weft_switch::{
    BoxedIo, Discovery, DiscoverySink, Incoming, Listener, SwitchError, Transport, TransportError,
};
use weft_types::address::{parse_peer_id, peer_id_of, socket_addr_of, with_peer_id, without_peer_id};
use weft_types::{Multiaddr, PeerId, PeerInfo, Protocol};

use message::{read_message, write_message, StarMessage};

/// Incoming relay connections queued before `accept` is called.
const INCOMING_BACKLOG: usize = 32;

/// Which star flavour an address uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StarKind {
    /// `/p2p-webrtc-star`
    WebRtc,
    /// `/p2p-websocket-star`
    WebSocket,
}

impl StarKind {
    pub fn protocol(&self) -> Protocol<'static> {
        match self {
            StarKind::WebRtc => Protocol::P2pWebRtcStar,
            StarKind::WebSocket => Protocol::P2pWebSocketStar,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            StarKind::WebRtc => "webrtc-star",
            StarKind::WebSocket => "websocket-star",
        }
    }

    /// True if `addr` carries this kind's star component.
    pub fn matches(&self, addr: &Multiaddr) -> bool {
        addr.iter().any(|p| match (self, p) {
            (StarKind::WebRtc, Protocol::P2pWebRtcStar) => true,
            (StarKind::WebSocket, Protocol::P2pWebSocketStar) => true,
            _ => false,
        })
    }
}

impl fmt::Display for StarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Peers announced by the server, handed to the discovery sink once one is attached.
#[derive(Default)]
struct Announcements {
    sink: Option<DiscoverySink>,
    backlog: Vec<PeerInfo>,
}

#[derive(Default)]
struct Shared {
    announcements: Mutex<Announcements>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Announcements> {
        self.announcements.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn announce(&self, info: PeerInfo) {
        let mut state = self.lock();
        let delivered = state
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(info.clone()).is_ok());
        if !delivered {
            state.sink = None;
            state.backlog.push(info);
        }
    }
}

/// Client side of a star rendezvous.
#[derive(Clone)]
pub struct StarTransport {
    kind: StarKind,
    local_peer: PeerId,
    shared: Arc<Shared>,
}

impl StarTransport {
    pub fn new(kind: StarKind, local_peer: PeerId) -> Self {
        Self {
            kind,
            local_peer,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn kind(&self) -> StarKind {
        self.kind
    }

    /// Discovery source fed by the server's member announcements.
    pub fn discovery(&self) -> StarDiscovery {
        StarDiscovery {
            kind: self.kind,
            shared: self.shared.clone(),
        }
    }

    async fn connect_server(&self, addr: &Multiaddr) -> Result<TcpStream, TransportError> {
        if !self.kind.matches(addr) {
            return Err(TransportError::UnsupportedAddress { addr: addr.clone() });
        }
        let server = socket_addr_of(addr)
            .ok_or_else(|| TransportError::UnsupportedAddress { addr: addr.clone() })?;
        let stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for StarTransport {
    fn name(&self) -> &'static str {
        self.kind.tag()
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.kind.matches(addr) && socket_addr_of(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
        let target = peer_id_of(addr).ok_or_else(|| TransportError::UnsupportedAddress {
            addr: addr.clone(),
        })?;
        let mut stream = self.connect_server(addr).await?;
        write_message(
            &mut stream,
            &StarMessage::Connect {
                target: target.to_string(),
                from: self.local_peer.to_string(),
            },
        )
        .await?;
        match read_message(&mut stream).await? {
            StarMessage::Ready => {
                debug!(peer_id = %target, kind = %self.kind, "star relay ready");
                Ok(Box::new(stream))
            }
            StarMessage::Rejected { reason } => Err(TransportError::Rejected { reason }),
            other => Err(TransportError::Io {
                reason: format!("unexpected star reply: {:?}", other),
            }),
        }
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let mut control = self.connect_server(addr).await?;
        write_message(
            &mut control,
            &StarMessage::Join {
                peer: self.local_peer.to_string(),
            },
        )
        .await?;
        let base = without_peer_id(addr);
        let peers = match read_message(&mut control).await? {
            StarMessage::Peers { peers } => peers,
            StarMessage::Rejected { reason } => return Err(TransportError::Rejected { reason }),
            other => {
                return Err(TransportError::Io {
                    reason: format!("unexpected star reply: {:?}", other),
                })
            }
        };
        info!(server = %base, kind = %self.kind, members = peers.len(), "joined star server");

        let signalling = Signalling {
            transport: self.clone(),
            base: base.clone(),
        };
        for peer in &peers {
            signalling.announce(peer);
        }

        let (tx, rx) = mpsc::channel(INCOMING_BACKLOG);
        let task = tokio::spawn(signalling.run(control, tx));
        Ok(Box::new(StarListener {
            local_addr: with_peer_id(&base, self.local_peer),
            rx,
            task,
        }))
    }
}

/// State for the control-connection task.
struct Signalling {
    transport: StarTransport,
    base: Multiaddr,
}

impl Signalling {
    fn announce(&self, peer: &str) {
        let id = match parse_peer_id(peer) {
            Ok(id) => id,
            Err(e) => {
                warn!(peer, error = %e, "star server announced an invalid peer id");
                return;
            }
        };
        if id == self.transport.local_peer {
            return;
        }
        debug!(peer_id = %id, kind = %self.transport.kind, "star peer announced");
        self.transport
            .shared
            .announce(PeerInfo::new(id).with_addr(with_peer_id(&self.base, id)));
    }

    async fn run(self, mut control: TcpStream, incoming: mpsc::Sender<Incoming>) {
        loop {
            let msg = match read_message(&mut control).await {
                Ok(msg) => msg,
                Err(e) => {
                    info!(server = %self.base, error = %e, "star control connection closed");
                    return;
                }
            };
            match msg {
                StarMessage::Peers { peers } => {
                    for peer in &peers {
                        self.announce(peer);
                    }
                }
                StarMessage::Joined { peer } => self.announce(&peer),
                StarMessage::Left { peer } => debug!(peer, "star peer left"),
                StarMessage::Incoming { token, from } => {
                    match self.accept_relay(token, &from).await {
                        Ok(conn) => {
                            if incoming.send(conn).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(from, error = %e, "failed to accept star relay"),
                    }
                }
                other => warn!(message = ?other, "unexpected star control message"),
            }
        }
    }

    async fn accept_relay(&self, token: u64, from: &str) -> Result<Incoming, TransportError> {
        let mut stream = self.transport.connect_server(&self.base).await?;
        write_message(&mut stream, &StarMessage::Accept { token }).await?;
        let remote_addr = match parse_peer_id(from) {
            Ok(id) => with_peer_id(&self.base, id),
            Err(_) => self.base.clone(),
        };
        Ok(Incoming {
            io: Box::new(stream),
            remote_addr,
        })
    }
}

struct StarListener {
    local_addr: Multiaddr,
    rx: mpsc::Receiver<Incoming>,
    task: JoinHandle<()>,
}

#[async_trait]
impl Listener for StarListener {
    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    async fn accept(&mut self) -> Result<Incoming, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

impl Drop for StarListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Discovery over a star server's member announcements.
pub struct StarDiscovery {
    kind: StarKind,
    shared: Arc<Shared>,
}

#[async_trait]
impl Discovery for StarDiscovery {
    fn tag(&self) -> &'static str {
        self.kind.tag()
    }

    async fn start(&self, sink: DiscoverySink) -> Result<(), SwitchError> {
        let mut state = self.shared.lock();
        for info in state.backlog.drain(..) {
            let _ = sink.send(info);
        }
        state.sink = Some(sink);
        Ok(())
    }

    async fn stop(&self) {
        self.shared.lock().sink = None;
    }
}

#[cfg(test)]
mod tests {
    use super::server::StarServer;
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use weft_types::identity::{keypair_from_seed, peer_id_of as key_peer_id};

    fn peer(seed: u8) -> PeerId {
        key_peer_id(&keypair_from_seed([seed; 32]).unwrap())
    }

    async fn server() -> StarServer {
        StarServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    async fn next_discovered(rx: &mut mpsc::UnboundedReceiver<PeerInfo>) -> PeerInfo {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no discovery in time")
            .expect("discovery channel closed")
    }

    #[test]
    fn test_kind_matches() {
        let webrtc: Multiaddr = "/ip4/127.0.0.1/tcp/15555/ws/p2p-webrtc-star".parse().unwrap();
        let ws: Multiaddr = "/ip4/127.0.0.1/tcp/15555/ws/p2p-websocket-star".parse().unwrap();
        assert!(StarKind::WebRtc.matches(&webrtc));
        assert!(!StarKind::WebRtc.matches(&ws));
        assert!(StarKind::WebSocket.matches(&ws));
        assert!(!StarKind::WebSocket.matches(&"/ip4/127.0.0.1/tcp/1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_listen_reports_peer_address() {
        let server = server().await;
        let addr = server.multiaddr(StarKind::WebRtc);
        let transport = StarTransport::new(StarKind::WebRtc, peer(1));
        let listener = transport.listen(&addr).await.unwrap();
        assert_eq!(listener.local_addr(), with_peer_id(&addr, peer(1)));
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.member_count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_members_discover_each_other() {
        let server = server().await;
        let addr = server.multiaddr(StarKind::WebSocket);

        let a = StarTransport::new(StarKind::WebSocket, peer(1));
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        a.discovery().start(a_tx).await.unwrap();
        let _a_listener = a.listen(&addr).await.unwrap();

        let b = StarTransport::new(StarKind::WebSocket, peer(2));
        let _b_listener = b.listen(&addr).await.unwrap();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        // Announcements made before start are replayed.
        b.discovery().start(b_tx).await.unwrap();

        let seen_by_a = next_discovered(&mut a_rx).await;
        assert_eq!(seen_by_a.id, peer(2));
        assert!(seen_by_a.multiaddrs.contains(&with_peer_id(&addr, peer(2))));

        let seen_by_b = next_discovered(&mut b_rx).await;
        assert_eq!(seen_by_b.id, peer(1));
    }

    #[tokio::test]
    async fn test_dial_through_server() {
        let server = server().await;
        let addr = server.multiaddr(StarKind::WebRtc);

        let a = StarTransport::new(StarKind::WebRtc, peer(1));
        let mut listener = a.listen(&addr).await.unwrap();
        let b = StarTransport::new(StarKind::WebRtc, peer(2));

        let target = listener.local_addr();
        let mut outbound = b.dial(&target).await.unwrap();
        let mut inbound = listener.accept().await.unwrap();
        assert_eq!(inbound.remote_addr, with_peer_id(&addr, peer(2)));

        outbound.write_all(b"hello star").await.unwrap();
        let mut buf = [0u8; 10];
        inbound.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello star");

        inbound.io.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_rejected() {
        let server = server().await;
        let addr = with_peer_id(&server.multiaddr(StarKind::WebRtc), peer(9));
        let b = StarTransport::new(StarKind::WebRtc, peer(2));
        let err = b.dial(&addr).await.err().unwrap();
        assert!(matches!(err, TransportError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_dial_needs_peer_id() {
        let server = server().await;
        let b = StarTransport::new(StarKind::WebRtc, peer(2));
        let err = b.dial(&server.multiaddr(StarKind::WebRtc)).await.err().unwrap();
        assert!(matches!(err, TransportError::UnsupportedAddress { .. }));
    }
}
