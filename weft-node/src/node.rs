use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weft_switch::{
    Connection, Discovery, PeerBook, Stream, StreamHandler, Switch, SwitchBuilder, SwitchError,
    SwitchEvent,
};
use weft_transport::{MemoryTransport, StarKind, StarTransport, TcpTransport};
use weft_types::address::with_peer_id;
use weft_types::{DialTarget, PeerId, PeerInfo};

use crate::bootstrap::Bootstrap;
use crate::error::NodeError;
use crate::metrics::NodeMetrics;
use crate::options::{muxer_by_name, NodeOptions};

/// What a node reports to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A discovery service reported a peer (already merged into the peer book).
    PeerDiscovery(PeerInfo),
    /// The first connection to a peer opened.
    PeerConnect(PeerInfo),
    /// The last connection to a peer closed.
    PeerDisconnect(PeerInfo),
}

struct NodeInner {
    peer_info: RwLock<PeerInfo>,
    switch: Switch,
    discoveries: Vec<Arc<dyn Discovery>>,
    events: broadcast::Sender<NodeEvent>,
    metrics: NodeMetrics,
    muxers: Vec<String>,
    auto_dial: bool,
    started: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    switch_events: Mutex<Option<broadcast::Receiver<SwitchEvent>>>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeInner {
    fn peer_info(&self) -> RwLockReadGuard<'_, PeerInfo> {
        self.peer_info.read().unwrap_or_else(|e| e.into_inner())
    }

    fn peer_info_mut(&self) -> RwLockWriteGuard<'_, PeerInfo> {
        self.peer_info.write().unwrap_or_else(|e| e.into_inner())
    }

    fn discovery_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.discovery_task.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Best known record for a peer.
    fn known(&self, peer: PeerId) -> PeerInfo {
        self.switch
            .peer_book()
            .get(&peer)
            .unwrap_or_else(|| PeerInfo::new(peer))
    }
}

/// A peer: a switch plus the transports, discovery services, and
/// bookkeeping chosen by [`NodeOptions`].
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Assemble a node. Listens on `peer_info.multiaddrs` once started.
    ///
    /// Fails when a private network is enforced without a protector, or when
    /// the muxer list is empty or names an unknown muxer.
    pub fn new(
        peer_info: PeerInfo,
        peer_book: Option<PeerBook>,
        options: NodeOptions,
    ) -> Result<Self, NodeError> {
        if options.force_private_network && options.protector.is_none() {
            return Err(NodeError::Config {
                reason: "private network is enforced, but no protector was provided".to_string(),
            });
        }
        if options.muxers.is_empty() {
            return Err(NodeError::Config {
                reason: "at least one stream muxer is required".to_string(),
            });
        }

        let local = peer_info.id;
        let mut builder = SwitchBuilder::new(local)
            .peer_book(peer_book.unwrap_or_default())
            .config(options.switch.clone());
        for name in &options.muxers {
            builder = builder.muxer(muxer_by_name(name)?);
        }

        let mut discoveries: Vec<Arc<dyn Discovery>> = Vec::new();
        for (enabled, kind) in [
            (options.webrtc_star, StarKind::WebRtc),
            (options.ws_star, StarKind::WebSocket),
        ] {
            if enabled {
                let star = StarTransport::new(kind, local);
                discoveries.push(Arc::new(star.discovery()));
                builder = builder.transport_for(move |addr| kind.matches(addr), Arc::new(star));
            }
        }
        if let Some(hub) = &options.memory_hub {
            builder = builder.transport(Arc::new(MemoryTransport::new(hub.clone())));
        }
        if options.tcp {
            builder = builder.transport(Arc::new(TcpTransport::new()));
        }
        for transport in options.transports {
            builder = builder.transport(transport);
        }
        if let Some(protector) = options.protector {
            builder = builder.protector(protector);
        }
        if !options.bootstrap.is_empty() {
            discoveries.push(Arc::new(Bootstrap::new(&options.bootstrap)));
        }

        let switch = builder.build()?;
        let switch_events = switch.subscribe();
        let (events, _) = broadcast::channel(options.switch.event_capacity);
        debug!(
            peer_id = %local,
            transports = ?switch.transport_names(),
            muxers = ?options.muxers,
            private = switch.has_protector(),
            "node created"
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                peer_info: RwLock::new(peer_info),
                switch,
                discoveries,
                events,
                metrics: NodeMetrics::new(),
                muxers: options.muxers,
                auto_dial: options.auto_dial,
                started: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                switch_events: Mutex::new(Some(switch_events)),
                discovery_task: Mutex::new(None),
            }),
        })
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn peer_id(&self) -> PeerId {
        self.inner.switch.local_peer()
    }

    /// Our own record: listen addresses (once started) and handled protocols.
    pub fn peer_info(&self) -> PeerInfo {
        self.inner.peer_info().clone()
    }

    pub fn peer_book(&self) -> &PeerBook {
        self.inner.switch.peer_book()
    }

    pub fn switch(&self) -> &Switch {
        &self.inner.switch
    }

    pub fn muxers(&self) -> &[String] {
        &self.inner.muxers
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.inner.metrics
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Events from now on. Nothing is replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Listen on our addresses and start discovery. Starting twice is a no-op.
    pub async fn start(&self) -> Result<(), NodeError> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }
        self.spawn_event_pump();

        let local = self.peer_id();
        let addrs = self.inner.peer_info().multiaddrs.to_vec();
        let bound = self.inner.switch.start(&addrs).await?;
        self.inner
            .peer_info_mut()
            .multiaddrs
            .replace(bound.iter().map(|addr| with_peer_id(addr, local)));

        let (sink, rx) = mpsc::unbounded_channel();
        for discovery in &self.inner.discoveries {
            if let Err(e) = discovery.start(sink.clone()).await {
                warn!(tag = discovery.tag(), error = %e, "discovery failed to start");
            }
        }
        let task = tokio::spawn(discovery_pump(Arc::downgrade(&self.inner), rx));
        *self.inner.discovery_task() = Some(task);

        self.inner.started.store(true, Ordering::SeqCst);
        info!(peer_id = %local, addrs = ?bound, "node started");
        Ok(())
    }

    /// Stop discovery, close every connection, and unbind. Safe to call repeatedly.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for discovery in &self.inner.discoveries {
            discovery.stop().await;
        }
        if let Some(task) = self.inner.discovery_task().take() {
            task.abort();
        }
        self.inner.switch.stop().await;
        info!(peer_id = %self.peer_id(), "node stopped");
    }

    fn spawn_event_pump(&self) {
        let rx = self
            .inner
            .switch_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = rx {
            tokio::spawn(event_pump(Arc::downgrade(&self.inner), rx));
        }
    }

    // ─── Dialing ─────────────────────────────────────────────────────────

    fn ensure_started(&self) -> Result<(), NodeError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(SwitchError::NotStarted.into())
        }
    }

    /// Connect to a peer, reusing an open connection.
    pub async fn dial(&self, target: impl Into<DialTarget>) -> Result<Arc<Connection>, NodeError> {
        self.ensure_started()?;
        self.inner.metrics.dials.inc();
        self.inner.switch.dial(target).await.map_err(|e| {
            self.inner.metrics.dial_failures.inc();
            NodeError::from(e)
        })
    }

    /// Connect and open a stream speaking `protocol`.
    pub async fn dial_protocol(
        &self,
        target: impl Into<DialTarget>,
        protocol: &str,
    ) -> Result<Stream, NodeError> {
        self.ensure_started()?;
        self.inner.metrics.dials.inc();
        self.inner
            .switch
            .dial_protocol(target, protocol)
            .await
            .map_err(|e| {
                self.inner.metrics.dial_failures.inc();
                NodeError::from(e)
            })
    }

    /// Close the connection to a peer. The peer stays in the peer book.
    pub async fn hang_up(&self, target: impl Into<DialTarget>) {
        self.inner.switch.hang_up(target).await;
    }

    // ─── Protocols ───────────────────────────────────────────────────────

    /// Serve `protocol` with `handler`. Registering the same id again replaces it.
    pub fn handle<H: StreamHandler>(&self, protocol: impl Into<String>, handler: H) {
        let protocol = protocol.into();
        self.inner.peer_info_mut().protocols.insert(protocol.clone());
        self.inner.switch.handle(protocol, handler);
    }

    pub fn unhandle(&self, protocol: &str) -> bool {
        self.inner.peer_info_mut().protocols.remove(protocol);
        self.inner.switch.unhandle(protocol)
    }

    fn on_discovered(&self, info: PeerInfo) {
        if info.id == self.peer_id() {
            return;
        }
        let merged = self.inner.switch.peer_book().put(info);
        self.inner.metrics.discovered_peers.inc();
        debug!(peer_id = %merged.id, addrs = merged.multiaddrs.len(), "peer discovered");
        self.inner.emit(NodeEvent::PeerDiscovery(merged.clone()));

        if self.inner.auto_dial && !self.inner.switch.is_connected(&merged.id) {
            let node = self.clone();
            let peer = merged.id;
            tokio::spawn(async move {
                if let Err(e) = node.dial(peer).await {
                    debug!(peer_id = %peer, error = %e, "auto-dial failed");
                }
            });
        }
    }
}

// ─── Background Tasks ───────────────────────────────────────────────────────

async fn event_pump(node: Weak<NodeInner>, mut rx: broadcast::Receiver<SwitchEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "node fell behind on switch events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let inner = match node.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        inner
            .metrics
            .peer_count
            .set(inner.switch.connection_count() as i64);
        let event = match event {
            SwitchEvent::PeerConnected(peer) => NodeEvent::PeerConnect(inner.known(peer)),
            SwitchEvent::PeerDisconnected(peer) => NodeEvent::PeerDisconnect(inner.known(peer)),
        };
        inner.emit(event);
    }
}

async fn discovery_pump(node: Weak<NodeInner>, mut rx: mpsc::UnboundedReceiver<PeerInfo>) {
    while let Some(info) = rx.recv().await {
        let inner = match node.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        Node { inner }.on_discovered(info);
    }
}
