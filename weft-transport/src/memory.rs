use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tracing::debug;
use weft_switch::{BoxedIo, Incoming, Listener, Transport, TransportError};
use weft_types::{Multiaddr, Protocol};

/// Buffer size of each direction of an in-memory connection.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Connections waiting to be accepted before new dials are refused.
const ACCEPT_BACKLOG: usize = 64;

/// The `/memory/<port>` address for a port.
pub fn memory_addr(port: u64) -> Multiaddr {
    Multiaddr::empty().with(Protocol::Memory(port))
}

/// The port of a `/memory/<port>[/p2p/<id>]` address.
pub fn memory_port(addr: &Multiaddr) -> Option<u64> {
    let mut iter = addr.iter();
    let port = match iter.next()? {
        Protocol::Memory(port) => port,
        _ => return None,
    };
    iter.all(|p| matches!(p, Protocol::P2p(_))).then_some(port)
}

#[derive(Default)]
struct HubState {
    listeners: HashMap<u64, mpsc::Sender<(DuplexStream, u64)>>,
    next_port: u64,
}

/// A process-local network. Transports sharing a hub can reach each other.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    dials: Arc<AtomicUsize>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connection attempts made through this hub.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }

    /// Number of bound listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn bind(&self, port: u64) -> Result<(u64, mpsc::Receiver<(DuplexStream, u64)>), TransportError> {
        let mut state = self.lock();
        let port = if port == 0 {
            loop {
                state.next_port += 1;
                if !state.listeners.contains_key(&state.next_port) {
                    break state.next_port;
                }
            }
        } else {
            port
        };
        if state.listeners.contains_key(&port) {
            return Err(TransportError::Io {
                reason: format!("memory port {} already in use", port),
            });
        }
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        state.listeners.insert(port, tx);
        Ok((port, rx))
    }

    fn unbind(&self, port: u64) {
        self.lock().listeners.remove(&port);
    }

    fn connect(&self, port: u64) -> Result<DuplexStream, TransportError> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        let sender = state
            .listeners
            .get(&port)
            .cloned()
            .ok_or_else(|| TransportError::Io {
                reason: format!("connection refused: nothing listening on memory port {}", port),
            })?;
        // Dialers get an ephemeral port of their own for the listener's view.
        state.next_port += 1;
        let dialer_port = state.next_port;
        drop(state);

        let (local, remote) = duplex(PIPE_BUFFER_SIZE);
        sender
            .try_send((remote, dialer_port))
            .map_err(|_| TransportError::Io {
                reason: format!("connection refused: memory port {} not accepting", port),
            })?;
        Ok(local)
    }
}

/// In-process transport over a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
}

impl MemoryTransport {
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        memory_port(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
        let port = memory_port(addr).ok_or_else(|| TransportError::UnsupportedAddress {
            addr: addr.clone(),
        })?;
        let io = self.hub.connect(port)?;
        Ok(Box::new(io))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let port = memory_port(addr).ok_or_else(|| TransportError::UnsupportedAddress {
            addr: addr.clone(),
        })?;
        let (port, rx) = self.hub.bind(port)?;
        debug!(port, "memory listener bound");
        Ok(Box::new(MemoryListener {
            port,
            rx,
            hub: self.hub.clone(),
        }))
    }
}

struct MemoryListener {
    port: u64,
    rx: mpsc::Receiver<(DuplexStream, u64)>,
    hub: MemoryHub,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> Multiaddr {
        memory_addr(self.port)
    }

    async fn accept(&mut self) -> Result<Incoming, TransportError> {
        let (io, dialer_port) = self.rx.recv().await.ok_or(TransportError::Closed)?;
        Ok(Incoming {
            io: Box::new(io),
            remote_addr: memory_addr(dialer_port),
        })
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.hub.unbind(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_memory_port() {
        assert_eq!(memory_port(&memory_addr(7)), Some(7));
        assert_eq!(memory_port(&"/ip4/127.0.0.1/tcp/1".parse().unwrap()), None);
        assert_eq!(memory_port(&"/memory/1/ws".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let transport = MemoryTransport::new(MemoryHub::new());
        let mut listener = transport.listen(&memory_addr(0)).await.unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr, memory_addr(0));

        let mut client = transport.dial(&addr).await.unwrap();
        let mut incoming = listener.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        incoming.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(transport.hub().dial_count(), 1);
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let transport = MemoryTransport::new(MemoryHub::new());
        let _first = transport.listen(&memory_addr(5)).await.unwrap();
        assert!(transport.listen(&memory_addr(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_without_listener() {
        let transport = MemoryTransport::new(MemoryHub::new());
        assert!(transport.dial(&memory_addr(42)).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_unbinds() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub.clone());
        let listener = transport.listen(&memory_addr(9)).await.unwrap();
        assert_eq!(hub.listener_count(), 1);
        drop(listener);
        assert_eq!(hub.listener_count(), 0);
        assert!(transport.dial(&memory_addr(9)).await.is_err());
    }
}
