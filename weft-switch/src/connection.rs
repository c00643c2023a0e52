use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use weft_types::{Multiaddr, PeerId};

use crate::error::SwitchError;
use crate::io::BoxedIo;
use crate::multistream;
use crate::muxer::MuxedSession;
use crate::stream::{Stream, StreamInfo, StreamStatus, StreamTable};

/// Lifecycle of a connection.
///
/// `Connecting` is only reported for peers with a dial still in flight; a
/// `Connection` value is created once its muxer is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// An upgraded, multiplexed connection to one peer.
pub struct Connection {
    id: u64,
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    direction: Direction,
    transport: &'static str,
    muxer: String,
    session: Arc<dyn MuxedSession>,
    streams: Arc<StreamTable>,
    state: AtomicU8,
    opened_at: Instant,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        remote_peer: PeerId,
        remote_addr: Multiaddr,
        direction: Direction,
        transport: &'static str,
        muxer: String,
        session: Arc<dyn MuxedSession>,
    ) -> Self {
        Self {
            id,
            remote_peer,
            remote_addr,
            direction,
            transport,
            muxer,
            session,
            streams: Arc::new(StreamTable::default()),
            state: AtomicU8::new(ConnectionState::Open as u8),
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Name of the transport that carried the connection.
    pub fn transport(&self) -> &'static str {
        self.transport
    }

    /// Negotiated muxer protocol.
    pub fn muxer(&self) -> &str {
        &self.muxer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.session.is_closed()
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        self.streams.snapshot()
    }

    /// Open a stream and negotiate `protocol` on it.
    ///
    /// A refusal fails only this stream; the connection stays open.
    pub async fn open_stream(
        &self,
        protocol: &str,
        negotiation_timeout: Duration,
    ) -> Result<Stream, SwitchError> {
        if !self.is_open() {
            return Err(SwitchError::ConnectionClosed {
                peer: self.remote_peer,
            });
        }
        let mut io = self.session.open_stream().await?;
        let (id, status) = self.streams.insert();
        let proposals = [protocol.to_string()];
        let negotiated = tokio::time::timeout(
            negotiation_timeout,
            multistream::dialer_select(&mut io, &proposals),
        )
        .await;
        match negotiated {
            Ok(Ok(selected)) => {
                debug!(peer_id = %self.remote_peer, protocol = %selected, "opened stream");
                Ok(Stream::new(
                    io,
                    id,
                    selected,
                    self.remote_peer,
                    status,
                    Arc::downgrade(&self.streams),
                ))
            }
            Ok(Err(e)) => {
                self.streams.remove(id);
                Err(e)
            }
            Err(_) => {
                self.streams.remove(id);
                Err(SwitchError::Timeout {
                    after: negotiation_timeout,
                })
            }
        }
    }

    /// Wrap an accepted muxer stream once its protocol is known.
    pub(crate) fn track_inbound(
        &self,
        io: BoxedIo,
        protocol: String,
        id: u64,
        status: Arc<StreamStatus>,
    ) -> Stream {
        Stream::new(
            io,
            id,
            protocol,
            self.remote_peer,
            status,
            Arc::downgrade(&self.streams),
        )
    }

    pub(crate) fn stream_table(&self) -> &Arc<StreamTable> {
        &self.streams
    }

    pub(crate) fn session(&self) -> &Arc<dyn MuxedSession> {
        &self.session
    }

    /// Begin closing. Streams are aborted and the switch forgets the
    /// connection once the muxer has stopped.
    pub fn close(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.session.close();
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.streams.close_all();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("transport", &self.transport)
            .field("muxer", &self.muxer)
            .field("state", &self.state())
            .finish()
    }
}
