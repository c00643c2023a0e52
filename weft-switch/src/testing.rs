//! In-process transport and helpers for switch tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use weft_types::identity::{keypair_from_seed, peer_id_of};
use weft_types::{Multiaddr, PeerId, Protocol};

use crate::error::TransportError;
use crate::io::BoxedIo;
use crate::muxer::mplex::MplexMuxer;
use crate::protector::Protector;
use crate::stream::Stream;
use crate::switch::{Switch, SwitchBuilder};
use crate::transport::{Incoming, Listener, Transport};
use crate::SwitchConfig;

pub(crate) fn peer(seed: u8) -> PeerId {
    peer_id_of(&keypair_from_seed([seed; 32]).unwrap())
}

pub(crate) fn memory_addr(port: u64) -> Multiaddr {
    Multiaddr::empty().with(Protocol::Memory(port))
}

fn memory_port(addr: &Multiaddr) -> Option<u64> {
    match addr.iter().next()? {
        Protocol::Memory(port) => Some(port),
        _ => None,
    }
}

/// Echo everything back, then close.
pub(crate) async fn echo(_protocol: String, mut stream: Stream) {
    let mut data = Vec::new();
    if stream.read_to_end(&mut data).await.is_ok() {
        let _ = stream.write_all(&data).await;
        let _ = stream.shutdown().await;
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Shared registry of pipe listeners.
#[derive(Default)]
pub(crate) struct PipeNetwork {
    listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<DuplexStream>>>,
    dials: AtomicUsize,
    dial_delay: Mutex<Duration>,
    panic_next: AtomicBool,
}

impl PipeNetwork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Physical connects attempted so far.
    pub(crate) fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock().unwrap() = delay;
    }

    /// Make the next dial blow up inside the transport.
    pub(crate) fn panic_on_next_dial(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct PipeTransport {
    net: Arc<PipeNetwork>,
}

impl PipeTransport {
    pub(crate) fn new(net: &Arc<PipeNetwork>) -> Self {
        Self { net: net.clone() }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        memory_port(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
        self.net.dials.fetch_add(1, Ordering::SeqCst);
        if self.net.panic_next.swap(false, Ordering::SeqCst) {
            panic!("pipe transport crashed");
        }
        let delay = *self.net.dial_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        let port = memory_port(addr).ok_or_else(|| TransportError::UnsupportedAddress {
            addr: addr.clone(),
        })?;
        let sender = self.net.listeners.lock().unwrap().get(&port).cloned();
        let sender = sender.ok_or_else(|| TransportError::Io {
            reason: "connection refused".to_string(),
        })?;
        let (local, remote) = duplex(64 * 1024);
        sender.send(remote).map_err(|_| TransportError::Io {
            reason: "connection refused".to_string(),
        })?;
        Ok(Box::new(local))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let port = memory_port(addr).ok_or_else(|| TransportError::UnsupportedAddress {
            addr: addr.clone(),
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.net.listeners.lock().unwrap().insert(port, tx);
        Ok(Box::new(PipeListener {
            port,
            rx,
            net: self.net.clone(),
        }))
    }
}

struct PipeListener {
    port: u64,
    rx: mpsc::UnboundedReceiver<DuplexStream>,
    net: Arc<PipeNetwork>,
}

#[async_trait]
impl Listener for PipeListener {
    fn local_addr(&self) -> Multiaddr {
        memory_addr(self.port)
    }

    async fn accept(&mut self) -> Result<Incoming, TransportError> {
        let io = self.rx.recv().await.ok_or(TransportError::Closed)?;
        Ok(Incoming {
            io: Box::new(io),
            remote_addr: memory_addr(0),
        })
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        self.net.listeners.lock().unwrap().remove(&self.port);
    }
}

pub(crate) fn build_switch(
    seed: u8,
    net: &Arc<PipeNetwork>,
    protector: Option<Arc<dyn Protector>>,
) -> Switch {
    let mut builder = SwitchBuilder::new(peer(seed))
        .transport(Arc::new(PipeTransport::new(net)))
        .muxer(Arc::new(MplexMuxer))
        .config(SwitchConfig {
            negotiation_timeout: Duration::from_secs(2),
            ..SwitchConfig::default()
        });
    if let Some(protector) = protector {
        builder = builder.protector(protector);
    }
    builder.build().unwrap()
}
