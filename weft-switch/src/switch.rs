use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use weft_types::address::{with_peer_id, without_peer_id};
use weft_types::{DialTarget, Multiaddr, MultiaddrSet, PeerId, PeerInfo};

use crate::config::SwitchConfig;
use crate::connection::{Connection, ConnectionState, Direction};
use crate::error::{AddressFailure, DialError, SwitchError, TransportError};
use crate::handshake::{self, Hello};
use crate::io::BoxedIo;
use crate::multistream;
use crate::muxer::{Endpoint, MuxedSession, MuxerRegistry, StreamMuxer};
use crate::peer_book::PeerBook;
use crate::protector::Protector;
use crate::protocol::{ProtocolRegistry, StreamHandler};
use crate::stream::Stream;
use crate::transport::{Incoming, Listener, Transport, TransportRegistry};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    /// The first open connection to a peer was established.
    PeerConnected(PeerId),
    /// The last open connection to a peer went away.
    PeerDisconnected(PeerId),
}

type DialResult = Result<Arc<Connection>, SwitchError>;
type PendingDial = Shared<BoxFuture<'static, DialResult>>;

/// What an in-flight dial is keyed by: the peer when it is known up front,
/// otherwise the bare address being dialed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DialKey {
    Peer(PeerId),
    Addr(Multiaddr),
}

#[derive(Default)]
struct ConnectionTable {
    open: HashMap<PeerId, Arc<Connection>>,
    /// In-flight dials. Every caller dialing the same key awaits the same future.
    dialing: HashMap<DialKey, PendingDial>,
}

impl ConnectionTable {
    fn open_at(&self, addr: &Multiaddr) -> Option<&Arc<Connection>> {
        self.open
            .values()
            .find(|c| c.is_open() && without_peer_id(c.remote_addr()) == *addr)
    }
}

struct Upgraded {
    hello: Hello,
    muxer: String,
    session: Arc<dyn MuxedSession>,
}

struct Inner {
    local_peer: PeerId,
    listen_addrs: RwLock<MultiaddrSet>,
    transports: TransportRegistry,
    muxers: MuxerRegistry,
    protocols: RwLock<ProtocolRegistry>,
    protector: Option<Arc<dyn Protector>>,
    peer_book: PeerBook,
    table: Mutex<ConnectionTable>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<SwitchEvent>,
    config: SwitchConfig,
    next_connection_id: AtomicU64,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, ConnectionTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn protocols(&self) -> RwLockReadGuard<'_, ProtocolRegistry> {
        self.protocols.read().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SwitchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Assembles a [`Switch`].
pub struct SwitchBuilder {
    local_peer: PeerId,
    peer_book: PeerBook,
    transports: TransportRegistry,
    muxers: MuxerRegistry,
    protector: Option<Arc<dyn Protector>>,
    config: SwitchConfig,
}

impl SwitchBuilder {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            peer_book: PeerBook::new(),
            transports: TransportRegistry::new(),
            muxers: MuxerRegistry::new(),
            protector: None,
            config: SwitchConfig::default(),
        }
    }

    /// Share an existing peer book instead of starting an empty one.
    pub fn peer_book(mut self, peer_book: PeerBook) -> Self {
        self.peer_book = peer_book;
        self
    }

    /// Register a transport for the addresses it reports it can dial.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.add(transport);
        self
    }

    /// Register a transport behind an explicit address predicate.
    pub fn transport_for<F>(mut self, predicate: F, transport: Arc<dyn Transport>) -> Self
    where
        F: Fn(&Multiaddr) -> bool + Send + Sync + 'static,
    {
        self.transports.register(predicate, transport);
        self
    }

    /// Add a muxer. Earlier muxers are preferred.
    pub fn muxer(mut self, muxer: Arc<dyn StreamMuxer>) -> Self {
        self.muxers.push(muxer);
        self
    }

    pub fn protector(mut self, protector: Arc<dyn Protector>) -> Self {
        self.protector = Some(protector);
        self
    }

    pub fn config(mut self, config: SwitchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Switch, SwitchError> {
        if self.muxers.is_empty() {
            return Err(SwitchError::Muxer {
                reason: "at least one stream muxer is required".to_string(),
            });
        }
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        Ok(Switch {
            inner: Arc::new(Inner {
                local_peer: self.local_peer,
                listen_addrs: RwLock::new(MultiaddrSet::new()),
                transports: self.transports,
                muxers: self.muxers,
                protocols: RwLock::new(ProtocolRegistry::new()),
                protector: self.protector,
                peer_book: self.peer_book,
                table: Mutex::new(ConnectionTable::default()),
                listeners: Mutex::new(Vec::new()),
                events,
                config: self.config,
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }
}

// ─── Switch ──────────────────────────────────────────────────────────────────

/// Owns every connection of a node.
///
/// At most one open connection is kept per peer. Concurrent dials to the same
/// peer share a single attempt, and that attempt runs on its own task so a
/// caller giving up never aborts it.
#[derive(Clone)]
pub struct Switch {
    inner: Arc<Inner>,
}

impl Switch {
    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    /// Addresses we are currently listening on.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner
            .listen_addrs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .to_vec()
    }

    pub fn peer_book(&self) -> &PeerBook {
        &self.inner.peer_book
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwitchEvent> {
        self.inner.events.subscribe()
    }

    /// Names of the registered transports, in resolution order.
    pub fn transport_names(&self) -> Vec<&'static str> {
        self.inner.transports.names()
    }

    /// Muxer protocol ids, in preference order.
    pub fn muxer_protocols(&self) -> Vec<String> {
        self.inner.muxers.protocols()
    }

    pub fn has_protector(&self) -> bool {
        self.inner.protector.is_some()
    }

    // ─── Protocol handlers ───────────────────────────────────────────────

    /// Serve inbound streams for `protocol`. Replaces an earlier handler.
    pub fn handle<H: StreamHandler>(&self, protocol: impl Into<String>, handler: H) {
        let protocol = protocol.into();
        debug!(protocol = %protocol, "registering handler");
        self.inner
            .protocols
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .handle(protocol, Arc::new(handler));
    }

    /// Serve inbound streams whose proposed protocol `predicate` accepts.
    pub fn handle_with_matcher<H, P>(&self, protocol: impl Into<String>, predicate: P, handler: H)
    where
        H: StreamHandler,
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.inner
            .protocols
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .handle_with_matcher(protocol, predicate, Arc::new(handler));
    }

    pub fn unhandle(&self, protocol: &str) -> bool {
        self.inner
            .protocols
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .unhandle(protocol)
    }

    /// Registered protocol ids.
    pub fn protocols(&self) -> Vec<String> {
        self.inner.protocols().protocols()
    }

    // ─── Connections ─────────────────────────────────────────────────────

    /// Every open connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.table().open.values().cloned().collect()
    }

    pub fn connection(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.inner.table().open.get(peer).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.table().open.len()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner
            .table()
            .open
            .get(peer)
            .is_some_and(|c| c.is_open())
    }

    pub fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        let table = self.inner.table();
        if let Some(conn) = table.open.get(peer) {
            return conn.state();
        }
        if table.dialing.contains_key(&DialKey::Peer(*peer)) {
            return ConnectionState::Connecting;
        }
        ConnectionState::Closed
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Listen on every address. Returns the addresses actually bound.
    ///
    /// If any address fails, listeners opened by this call are shut again.
    pub async fn start(&self, addrs: &[Multiaddr]) -> Result<Vec<Multiaddr>, SwitchError> {
        let mut bound = Vec::with_capacity(addrs.len());
        let mut handles = Vec::with_capacity(addrs.len());
        for addr in addrs {
            match self.listen_on(addr).await {
                Ok((local, handle)) => {
                    bound.push(local);
                    handles.push(handle);
                }
                Err(e) => {
                    for handle in handles {
                        handle.abort();
                    }
                    return Err(e);
                }
            }
        }
        self.inner
            .listen_addrs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(bound.iter().cloned());
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
        Ok(bound)
    }

    async fn listen_on(
        &self,
        addr: &Multiaddr,
    ) -> Result<(Multiaddr, JoinHandle<()>), SwitchError> {
        let transport =
            self.inner
                .transports
                .resolve(addr)
                .map_err(|_| SwitchError::TransportBind {
                    addr: addr.clone(),
                    reason: "no transport for address".to_string(),
                })?;
        let listener = transport
            .listen(addr)
            .await
            .map_err(|e| SwitchError::TransportBind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local = listener.local_addr();
        info!(addr = %local, transport = transport.name(), "listening");
        let handle = tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            listener,
            transport.name(),
        ));
        Ok((local, handle))
    }

    /// Stop listening and close every connection. Safe to call repeatedly.
    ///
    /// Dials still in flight are allowed to finish first, then closed with
    /// the rest.
    pub async fn stop(&self) {
        let listeners: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for handle in &listeners {
            handle.abort();
        }
        for handle in listeners {
            // Waiting lets the listener drop and release its address.
            let _ = handle.await;
        }

        let pending: Vec<PendingDial> = self.inner.table().dialing.values().cloned().collect();
        if !pending.is_empty() {
            debug!(dials = pending.len(), "waiting for in-flight dials before stopping");
            futures::future::join_all(pending).await;
        }

        let closed: Vec<Arc<Connection>> = {
            let mut table = self.inner.table();
            let closed: Vec<Arc<Connection>> = table.open.drain().map(|(_, c)| c).collect();
            for conn in &closed {
                self.inner
                    .emit(SwitchEvent::PeerDisconnected(conn.remote_peer()));
            }
            closed
        };
        for conn in &closed {
            conn.close();
            conn.mark_closed();
        }
        self.inner
            .listen_addrs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Vec::new());
        info!(connections = closed.len(), "switch stopped");
    }

    // ─── Dialing ─────────────────────────────────────────────────────────

    /// Connect to a peer, reusing an open connection when there is one.
    ///
    /// Candidate addresses are tried in order; the first that completes the
    /// whole upgrade wins. With a single candidate its own error is returned,
    /// otherwise the per-address causes are collected in a `DialError`.
    pub async fn dial(
        &self,
        target: impl Into<DialTarget>,
    ) -> Result<Arc<Connection>, SwitchError> {
        let target = target.into();
        let (peer, addrs) = self.resolve_target(&target)?;
        let key = match peer {
            Some(peer) => DialKey::Peer(peer),
            // A bare address; the remote id is only learned in the handshake.
            None => DialKey::Addr(
                addrs
                    .first()
                    .map(without_peer_id)
                    .unwrap_or_else(Multiaddr::empty),
            ),
        };
        self.dial_shared(key, peer, addrs).await
    }

    /// Like [`dial`](Self::dial), but stop waiting after `after`.
    ///
    /// The attempt itself keeps running; if it succeeds later, the
    /// connection is registered as usual.
    pub async fn dial_with_timeout(
        &self,
        target: impl Into<DialTarget>,
        after: Duration,
    ) -> Result<Arc<Connection>, SwitchError> {
        tokio::time::timeout(after, self.dial(target))
            .await
            .map_err(|_| SwitchError::Timeout { after })?
    }

    /// Connect and open a stream for `protocol`.
    ///
    /// A refused protocol fails only the stream; the connection stays open.
    pub async fn dial_protocol(
        &self,
        target: impl Into<DialTarget>,
        protocol: &str,
    ) -> Result<Stream, SwitchError> {
        let conn = self.dial(target).await?;
        let stream = conn
            .open_stream(protocol, self.inner.config.negotiation_timeout)
            .await?;
        self.inner
            .peer_book
            .add_protocol(conn.remote_peer(), protocol);
        Ok(stream)
    }

    /// Like [`dial_protocol`](Self::dial_protocol), but stop waiting after `after`.
    pub async fn dial_protocol_with_timeout(
        &self,
        target: impl Into<DialTarget>,
        protocol: &str,
        after: Duration,
    ) -> Result<Stream, SwitchError> {
        tokio::time::timeout(after, self.dial_protocol(target, protocol))
            .await
            .map_err(|_| SwitchError::Timeout { after })?
    }

    /// Close the connection to a peer.
    ///
    /// A dial still in flight is allowed to finish first, then closed. Hanging
    /// up on a peer we are not connected to does nothing.
    pub async fn hang_up(&self, target: impl Into<DialTarget>) {
        let target = target.into();
        let peer = match target.peer_id() {
            Some(peer) => peer,
            None => match &target {
                DialTarget::Addr(addr) => {
                    let key = DialKey::Addr(without_peer_id(addr));
                    let pending = self.inner.table().dialing.get(&key).cloned();
                    if let Some(pending) = pending {
                        debug!(addr = %addr, "waiting for in-flight dial before hanging up");
                        let _ = pending.await;
                    }
                    match self.peer_at(addr) {
                        Some(peer) => peer,
                        None => return,
                    }
                }
                _ => return,
            },
        };

        let pending = self.inner.table().dialing.get(&DialKey::Peer(peer)).cloned();
        if let Some(pending) = pending {
            debug!(peer_id = %peer, "waiting for in-flight dial before hanging up");
            let _ = pending.await;
        }

        let conn = {
            let mut table = self.inner.table();
            let conn = table.open.remove(&peer);
            if conn.is_some() {
                self.inner.emit(SwitchEvent::PeerDisconnected(peer));
            }
            conn
        };
        if let Some(conn) = conn {
            conn.close();
            conn.mark_closed();
            info!(peer_id = %peer, "hung up");
        }
    }

    fn peer_at(&self, addr: &Multiaddr) -> Option<PeerId> {
        self.inner
            .table()
            .open_at(&without_peer_id(addr))
            .map(|c| c.remote_peer())
    }

    fn resolve_target(
        &self,
        target: &DialTarget,
    ) -> Result<(Option<PeerId>, Vec<Multiaddr>), SwitchError> {
        let peer = target.peer_id();
        if peer == Some(self.inner.local_peer) {
            return Err(SwitchError::DialSelf);
        }
        let addrs = match target {
            DialTarget::Peer(info) => self.inner.peer_book.put(info.clone()).multiaddrs.to_vec(),
            DialTarget::Addr(addr) => vec![addr.clone()],
            DialTarget::Id(id) => self
                .inner
                .peer_book
                .get(id)
                .map(|info| info.multiaddrs.to_vec())
                .unwrap_or_default(),
        };
        Ok((peer, addrs))
    }

    /// Reuse an open connection, join a dial already in flight for `key`, or
    /// start a new one on its own task.
    async fn dial_shared(
        &self,
        key: DialKey,
        peer: Option<PeerId>,
        addrs: Vec<Multiaddr>,
    ) -> DialResult {
        let pending = {
            let mut table = self.inner.table();
            let open = match &key {
                DialKey::Peer(peer) => table.open.get(peer).filter(|c| c.is_open()),
                DialKey::Addr(addr) => table.open_at(addr),
            };
            if let Some(conn) = open {
                return Ok(conn.clone());
            }
            match table.dialing.get(&key) {
                Some(pending) => {
                    debug!(dial = ?key, "joining in-flight dial");
                    pending.clone()
                }
                None => {
                    let switch = self.clone();
                    let task_key = key.clone();
                    let task =
                        tokio::spawn(async move { switch.run_dial(task_key, peer, addrs).await });
                    let inner = Arc::downgrade(&self.inner);
                    let failed_key = key.clone();
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            // The task never got to clear its own entry.
                            if let Some(inner) = inner.upgrade() {
                                inner.table().dialing.remove(&failed_key);
                            }
                            Err(task_failed(e))
                        })
                    }
                    .boxed()
                    .shared();
                    table.dialing.insert(key, pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    async fn run_dial(
        &self,
        key: DialKey,
        peer: Option<PeerId>,
        addrs: Vec<Multiaddr>,
    ) -> DialResult {
        match self.dial_addrs(peer, addrs).await {
            Ok(conn) => Ok(self.register(conn, Some(&key))),
            Err(e) => {
                self.inner.table().dialing.remove(&key);
                warn!(dial = ?key, error = %e, "dial failed");
                Err(e)
            }
        }
    }

    async fn dial_addrs(&self, peer: Option<PeerId>, addrs: Vec<Multiaddr>) -> DialResult {
        if let (Some(peer), true) = (peer, addrs.is_empty()) {
            return Err(SwitchError::NoAddresses { peer });
        }
        let mut failures = Vec::new();
        for addr in addrs {
            match self.dial_addr(&addr, peer).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "dial attempt failed");
                    failures.push(AddressFailure {
                        addr,
                        error: Box::new(e),
                    });
                }
            }
        }
        if failures.len() == 1 {
            return Err(*failures.remove(0).error);
        }
        Err(DialError { peer, failures }.into())
    }

    async fn dial_addr(&self, addr: &Multiaddr, expected: Option<PeerId>) -> DialResult {
        let transport = self.inner.transports.resolve(addr)?;
        debug!(addr = %addr, transport = transport.name(), "dialing");
        let dial_timeout = self.inner.config.dial_timeout;
        let io = tokio::time::timeout(dial_timeout, transport.dial(addr))
            .await
            .map_err(|_| SwitchError::Timeout {
                after: dial_timeout,
            })??;
        let upgraded = self.upgrade(io, Endpoint::Dialer, expected).await?;
        self.record_hello(&upgraded.hello, Some(addr));
        Ok(Arc::new(Connection::new(
            self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed),
            upgraded.hello.peer_id,
            addr.clone(),
            Direction::Outbound,
            transport.name(),
            upgraded.muxer,
            upgraded.session,
        )))
    }

    // ─── Upgrade pipeline ────────────────────────────────────────────────

    /// protector → hello exchange → muxer negotiation, bounded by the
    /// negotiation timeout.
    async fn upgrade(
        &self,
        io: BoxedIo,
        endpoint: Endpoint,
        expected: Option<PeerId>,
    ) -> Result<Upgraded, SwitchError> {
        let after = self.inner.config.negotiation_timeout;
        tokio::time::timeout(after, self.upgrade_inner(io, endpoint, expected))
            .await
            .map_err(|_| SwitchError::Timeout { after })?
    }

    async fn upgrade_inner(
        &self,
        io: BoxedIo,
        endpoint: Endpoint,
        expected: Option<PeerId>,
    ) -> Result<Upgraded, SwitchError> {
        let mut io = match &self.inner.protector {
            Some(protector) => protector.protect(io).await?,
            None => io,
        };
        let hello = handshake::exchange(&mut io, &self.local_hello()).await?;
        if hello.peer_id == self.inner.local_peer {
            return Err(SwitchError::DialSelf);
        }
        if let Some(expected) = expected {
            if expected != hello.peer_id {
                return Err(SwitchError::PeerIdMismatch {
                    expected,
                    actual: hello.peer_id,
                });
            }
        }
        let (muxer, session) = self.inner.muxers.negotiate(io, endpoint).await?;
        Ok(Upgraded {
            hello,
            muxer,
            session,
        })
    }

    fn local_hello(&self) -> Hello {
        Hello {
            peer_id: self.inner.local_peer,
            listen_addrs: self.listen_addrs(),
            protocols: self.protocols(),
        }
    }

    /// Fold what a peer told us about itself into the peer book.
    fn record_hello(&self, hello: &Hello, dialed: Option<&Multiaddr>) {
        let mut info = PeerInfo::new(hello.peer_id);
        if let Some(addr) = dialed {
            info.multiaddrs.add(with_peer_id(addr, hello.peer_id));
        }
        info.multiaddrs.extend(
            hello
                .listen_addrs
                .iter()
                .map(|addr| with_peer_id(addr, hello.peer_id)),
        );
        info.protocols.extend(hello.protocols.iter().cloned());
        self.inner.peer_book.put(info);
    }

    async fn accept_connection(&self, incoming: Incoming, transport: &'static str) {
        let Incoming { io, remote_addr } = incoming;
        match self.upgrade(io, Endpoint::Listener, None).await {
            Ok(upgraded) => {
                self.record_hello(&upgraded.hello, None);
                let conn = Arc::new(Connection::new(
                    self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed),
                    upgraded.hello.peer_id,
                    remote_addr,
                    Direction::Inbound,
                    transport,
                    upgraded.muxer,
                    upgraded.session,
                ));
                self.register(conn, None);
            }
            Err(e) => debug!(addr = %remote_addr, error = %e, "inbound upgrade failed"),
        }
    }

    // ─── Connection table ────────────────────────────────────────────────

    /// Install a freshly upgraded connection and return the one that ends
    /// up serving the peer.
    ///
    /// When a connection already exists the two are compared: same
    /// direction keeps the existing one, opposite directions keep the one
    /// dialed by the smaller peer id so both ends pick the same survivor.
    fn register(&self, conn: Arc<Connection>, dialing: Option<&DialKey>) -> Arc<Connection> {
        let peer = conn.remote_peer();
        let mut table = self.inner.table();
        if let Some(dialing) = dialing {
            table.dialing.remove(dialing);
        }
        let existing = table.open.get(&peer).cloned();
        match existing {
            Some(existing) if existing.is_open() && !self.prefers(&conn, &existing) => {
                drop(table);
                debug!(peer_id = %peer, "duplicate connection, keeping existing");
                conn.close();
                existing
            }
            Some(existing) => {
                let was_open = existing.is_open();
                table.open.insert(peer, conn.clone());
                if !was_open {
                    self.inner.emit(SwitchEvent::PeerDisconnected(peer));
                    self.inner.emit(SwitchEvent::PeerConnected(peer));
                }
                self.spawn_driver(conn.clone());
                drop(table);
                debug!(peer_id = %peer, direction = ?conn.direction(), "replacing connection");
                existing.close();
                existing.mark_closed();
                conn
            }
            None => {
                table.open.insert(peer, conn.clone());
                self.inner.emit(SwitchEvent::PeerConnected(peer));
                self.spawn_driver(conn.clone());
                drop(table);
                info!(
                    peer_id = %peer,
                    addr = %conn.remote_addr(),
                    direction = ?conn.direction(),
                    "peer connected"
                );
                conn
            }
        }
    }

    fn prefers(&self, candidate: &Connection, existing: &Connection) -> bool {
        if candidate.direction() == existing.direction() {
            return false;
        }
        let dialer = |c: &Connection| match c.direction() {
            Direction::Outbound => self.inner.local_peer,
            Direction::Inbound => c.remote_peer(),
        };
        dialer(candidate).to_bytes() < dialer(existing).to_bytes()
    }

    /// Accept inbound streams until the muxer stops, then retire the connection.
    fn spawn_driver(&self, conn: Arc<Connection>) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(io) = conn.session().accept_stream().await {
                let Some(strong) = inner.upgrade() else { break };
                let switch = Switch { inner: strong };
                let conn = conn.clone();
                tokio::spawn(async move { switch.serve_stream(conn, io).await });
            }
            conn.mark_closed();
            if let Some(inner) = inner.upgrade() {
                Switch { inner }.retire(&conn);
            }
        });
    }

    fn retire(&self, conn: &Arc<Connection>) {
        let peer = conn.remote_peer();
        let mut table = self.inner.table();
        let current = table
            .open
            .get(&peer)
            .is_some_and(|c| Arc::ptr_eq(c, conn));
        if current {
            table.open.remove(&peer);
            self.inner.emit(SwitchEvent::PeerDisconnected(peer));
            drop(table);
            info!(peer_id = %peer, uptime = ?conn.age(), "peer disconnected");
        }
    }

    /// Negotiate an inbound stream and run its handler.
    async fn serve_stream(&self, conn: Arc<Connection>, mut io: BoxedIo) {
        let (id, status) = conn.stream_table().insert();
        let after = self.inner.config.negotiation_timeout;
        let inner = self.inner.clone();
        let negotiated = tokio::time::timeout(
            after,
            multistream::listener_select(&mut io, |p| inner.protocols().supports(p)),
        )
        .await;
        let protocol = match negotiated {
            Ok(Ok(protocol)) => protocol,
            Ok(Err(e)) => {
                debug!(peer_id = %conn.remote_peer(), error = %e, "inbound stream negotiation failed");
                conn.stream_table().remove(id);
                return;
            }
            Err(_) => {
                debug!(peer_id = %conn.remote_peer(), "inbound stream negotiation timed out");
                conn.stream_table().remove(id);
                return;
            }
        };
        let handler = self.inner.protocols().resolve(&protocol);
        match handler {
            Some(handler) => {
                debug!(peer_id = %conn.remote_peer(), protocol = %protocol, "inbound stream");
                let stream = conn.track_inbound(io, protocol.clone(), id, status);
                handler.call(protocol, stream).await;
            }
            None => conn.stream_table().remove(id),
        }
    }
}

async fn accept_loop(inner: Weak<Inner>, mut listener: Box<dyn Listener>, transport: &'static str) {
    loop {
        match listener.accept().await {
            Ok(incoming) => {
                let Some(inner) = inner.upgrade() else { break };
                let switch = Switch { inner };
                tokio::spawn(async move { switch.accept_connection(incoming, transport).await });
            }
            Err(TransportError::Closed) => break,
            Err(e) => {
                warn!(transport, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!(transport, "listener stopped");
}

fn task_failed(e: JoinError) -> SwitchError {
    SwitchError::Io {
        reason: format!("dial task failed: {}", e),
    }
}
