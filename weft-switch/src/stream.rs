use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use weft_types::PeerId;

use crate::io::BoxedIo;

/// Lifecycle of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Negotiating,
    Open,
    Closed,
}

/// Snapshot of one tracked stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: u64,
    pub protocol: Option<String>,
    pub state: StreamState,
}

#[derive(Debug)]
pub(crate) struct StreamStatus {
    inner: Mutex<(Option<String>, StreamState)>,
}

impl StreamStatus {
    fn new() -> Self {
        Self {
            inner: Mutex::new((None, StreamState::Negotiating)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (Option<String>, StreamState)> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn open(&self, protocol: &str) {
        let mut inner = self.lock();
        inner.0 = Some(protocol.to_string());
        inner.1 = StreamState::Open;
    }

    pub(crate) fn close(&self) {
        self.lock().1 = StreamState::Closed;
    }

    pub(crate) fn state(&self) -> StreamState {
        self.lock().1
    }

    fn snapshot(&self, id: u64) -> StreamInfo {
        let inner = self.lock();
        StreamInfo {
            id,
            protocol: inner.0.clone(),
            state: inner.1,
        }
    }
}

/// The streams of one connection.
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<StreamStatus>>>,
}

impl StreamTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<StreamStatus>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new stream in the negotiating state.
    pub(crate) fn insert(&self) -> (u64, Arc<StreamStatus>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(StreamStatus::new());
        self.lock().insert(id, status.clone());
        (id, status)
    }

    pub(crate) fn remove(&self, id: u64) {
        if let Some(status) = self.lock().remove(&id) {
            status.close();
        }
    }

    /// Mark every stream closed and forget them.
    pub(crate) fn close_all(&self) {
        for (_, status) in self.lock().drain() {
            status.close();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self
            .lock()
            .iter()
            .map(|(id, status)| status.snapshot(*id))
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

/// A negotiated logical stream, bound to one protocol.
///
/// Reads and writes go straight to the muxer stream. Shutting down closes
/// the write side; dropping the handle closes the stream.
pub struct Stream {
    io: BoxedIo,
    id: u64,
    protocol: String,
    remote_peer: PeerId,
    status: Arc<StreamStatus>,
    table: Weak<StreamTable>,
}

impl Stream {
    pub(crate) fn new(
        io: BoxedIo,
        id: u64,
        protocol: String,
        remote_peer: PeerId,
        status: Arc<StreamStatus>,
        table: Weak<StreamTable>,
    ) -> Self {
        status.open(&protocol);
        Self {
            io,
            id,
            protocol,
            remote_peer,
            status,
            table,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The protocol negotiated for this stream.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn state(&self) -> StreamState {
        self.status.state()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote_peer", &self.remote_peer)
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.status.close();
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use weft_types::identity::{keypair_from_seed, peer_id_of};

    fn peer() -> PeerId {
        peer_id_of(&keypair_from_seed([5u8; 32]).unwrap())
    }

    #[test]
    fn test_table_lifecycle() {
        let table = StreamTable::default();
        let (a, status_a) = table.insert();
        let (b, _) = table.insert();
        assert_ne!(a, b);
        assert_eq!(status_a.state(), StreamState::Negotiating);
        status_a.open("/echo/1.0.0");
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].protocol.as_deref(), Some("/echo/1.0.0"));
        assert_eq!(snapshot[0].state, StreamState::Open);

        table.remove(a);
        assert_eq!(status_a.state(), StreamState::Closed);
        assert_eq!(table.len(), 1);

        table.close_all();
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_stream_io_and_drop() {
        let table = Arc::new(StreamTable::default());
        let (id, status) = table.insert();
        let (a, mut b) = duplex(1024);
        let mut stream = Stream::new(
            Box::new(a),
            id,
            "/echo/1.0.0".to_string(),
            peer(),
            status.clone(),
            Arc::downgrade(&table),
        );
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(stream.protocol(), "/echo/1.0.0");

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(stream);
        assert_eq!(status.state(), StreamState::Closed);
        assert_eq!(table.len(), 0);
    }
}
