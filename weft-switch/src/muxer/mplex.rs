//! The mplex stream multiplexer.
//!
//! Wire format: `[4-byte BE stream id][1-byte flag][4-byte BE length][payload]`.
//! Stream ids are allocated independently by each side, so a stream is keyed
//! by its id plus whether we opened it; the flag tells the receiver which side
//! sent the frame.
//!
//! Each session runs two tasks. The reader routes inbound frames into
//! per-stream buffers without ever blocking on the network, and the writer
//! drains the outbound queues shared by all streams. Keeping them apart means a
//! peer that is busy writing can always make progress reading.
//!
//! Stream writes go through a bounded queue, so a slow connection makes
//! writers wait. A stream whose unread data grows past [`MAX_STREAM_BUFFER`]
//! is reset.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};
use weft_types::constants::{MAX_FRAME_SIZE, MAX_WRITE_CHUNK, MPLEX_PROTOCOL};

use super::{Endpoint, MuxedSession, StreamMuxer};
use crate::error::SwitchError;
use crate::io::BoxedIo;

const HEADER_LEN: usize = 9;

/// Inbound streams waiting for the accept loop before new ones are reset.
const MAX_PENDING_INBOUND: usize = 128;

/// Data frames queued for the writer before stream writes wait.
const OUTBOUND_CAPACITY: usize = 64;

/// Unread bytes a stream may hold before it is reset.
pub const MAX_STREAM_BUFFER: usize = 4 * 1024 * 1024;

/// How long a closing session keeps flushing queued frames.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ─── Frames ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    NewStream = 0,
    MessageReceiver = 1,
    MessageInitiator = 2,
    CloseReceiver = 3,
    CloseInitiator = 4,
    ResetReceiver = 5,
    ResetInitiator = 6,
}

impl Flag {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Flag::NewStream),
            1 => Some(Flag::MessageReceiver),
            2 => Some(Flag::MessageInitiator),
            3 => Some(Flag::CloseReceiver),
            4 => Some(Flag::CloseInitiator),
            5 => Some(Flag::ResetReceiver),
            6 => Some(Flag::ResetInitiator),
            _ => None,
        }
    }

    /// Whether the sender of this frame is the side that opened the stream.
    fn from_initiator(self) -> bool {
        matches!(
            self,
            Flag::NewStream | Flag::MessageInitiator | Flag::CloseInitiator | Flag::ResetInitiator
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub flag: Flag,
    pub payload: Bytes,
}

impl Frame {
    fn new(stream_id: u32, flag: Flag, payload: Bytes) -> Self {
        Self {
            stream_id,
            flag,
            payload,
        }
    }
}

/// Codec for mplex frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct MplexCodec;

impl Decoder for MplexCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let stream_id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let flag = Flag::from_u8(src[4]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown mplex flag {}", src[4]),
            )
        })?;
        let len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
            ));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame::new(stream_id, flag, payload)))
    }
}

impl Encoder<Frame> for MplexCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame too large: {} bytes (max {})",
                    frame.payload.len(),
                    MAX_FRAME_SIZE
                ),
            ));
        }
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u32(frame.stream_id);
        dst.put_u8(frame.flag as u8);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

// ─── Stream bookkeeping ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StreamKey {
    id: u32,
    /// True when this side opened the stream.
    local: bool,
}

impl StreamKey {
    fn message_flag(self) -> Flag {
        if self.local {
            Flag::MessageInitiator
        } else {
            Flag::MessageReceiver
        }
    }

    fn close_flag(self) -> Flag {
        if self.local {
            Flag::CloseInitiator
        } else {
            Flag::CloseReceiver
        }
    }

    fn reset_flag(self) -> Flag {
        if self.local {
            Flag::ResetInitiator
        } else {
            Flag::ResetReceiver
        }
    }
}

struct Slot {
    inbound: mpsc::UnboundedSender<Bytes>,
    /// Bytes sent to the stream that it has not read yet.
    unread: Arc<AtomicUsize>,
    reset: Arc<AtomicBool>,
}

/// Queues feeding the writer task.
///
/// Data and close frames share the bounded queue so they stay in order.
/// Stream opens and resets use the control queue, which never waits and is
/// drained first.
#[derive(Clone)]
struct Outbound {
    data: mpsc::Sender<Frame>,
    control: mpsc::UnboundedSender<Frame>,
}

impl Outbound {
    /// Queue behind pending data when there is room, otherwise jump ahead.
    fn push(&self, frame: Frame) {
        if let Err(e) = self.data.try_send(frame) {
            let _ = self.control.send(e.into_inner());
        }
    }
}

struct Shared {
    streams: Mutex<HashMap<StreamKey, Slot>>,
    closed: CancellationToken,
}

impl Shared {
    fn register(self: &Arc<Self>, key: StreamKey, outbound: &Outbound) -> MplexStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let unread = Arc::new(AtomicUsize::new(0));
        let reset = Arc::new(AtomicBool::new(false));
        self.lock().insert(
            key,
            Slot {
                inbound: tx,
                unread: unread.clone(),
                reset: reset.clone(),
            },
        );
        MplexStream {
            key,
            inbound: rx,
            buffered: Bytes::new(),
            unread,
            reset,
            read_closed: false,
            write_closed: false,
            sink: PollSender::new(outbound.data.clone()),
            outbound: outbound.clone(),
            shared: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamKey, Slot>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, key: StreamKey) -> Option<Slot> {
        self.lock().remove(&key)
    }

    /// Abort every stream still attached to the session.
    fn reset_all(&self) {
        for (_, slot) in self.lock().drain() {
            slot.reset.store(true, Ordering::Release);
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// The mplex muxer.
#[derive(Debug, Default, Clone, Copy)]
pub struct MplexMuxer;

impl StreamMuxer for MplexMuxer {
    fn protocol(&self) -> &str {
        MPLEX_PROTOCOL
    }

    fn upgrade(&self, io: BoxedIo, _endpoint: Endpoint) -> Arc<dyn MuxedSession> {
        MplexSession::new(io)
    }
}

/// One multiplexed connection.
pub struct MplexSession {
    shared: Arc<Shared>,
    outbound: Outbound,
    incoming: tokio::sync::Mutex<mpsc::Receiver<BoxedIo>>,
    next_id: AtomicU32,
}

impl MplexSession {
    /// Start multiplexing `io`. Spawns the reader and writer tasks.
    pub fn new(io: BoxedIo) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(io);
        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });
        let (data_tx, data_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let outbound = Outbound {
            data: data_tx,
            control: control_tx,
        };
        let (in_tx, in_rx) = mpsc::channel(MAX_PENDING_INBOUND);

        tokio::spawn(read_loop(
            FramedRead::new(read_half, MplexCodec),
            shared.clone(),
            outbound.clone(),
            in_tx,
        ));
        tokio::spawn(write_loop(
            FramedWrite::new(write_half, MplexCodec),
            shared.clone(),
            control_rx,
            data_rx,
        ));

        Arc::new(Self {
            shared,
            outbound,
            incoming: tokio::sync::Mutex::new(in_rx),
            next_id: AtomicU32::new(0),
        })
    }

    /// Number of streams currently attached.
    pub fn stream_count(&self) -> usize {
        self.shared.lock().len()
    }
}

#[async_trait]
impl MuxedSession for MplexSession {
    async fn open_stream(&self) -> Result<BoxedIo, SwitchError> {
        if self.shared.closed.is_cancelled() {
            return Err(SwitchError::Muxer {
                reason: "session closed".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = StreamKey { id, local: true };
        let stream = self.shared.register(key, &self.outbound);
        self.outbound
            .control
            .send(Frame::new(id, Flag::NewStream, Bytes::from(id.to_string())))
            .map_err(|_| SwitchError::Muxer {
                reason: "session closed".to_string(),
            })?;
        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> Option<BoxedIo> {
        self.incoming.lock().await.recv().await
    }

    fn close(&self) {
        self.shared.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await
    }
}

impl Drop for MplexSession {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

async fn read_loop(
    mut frames: FramedRead<ReadHalf<BoxedIo>, MplexCodec>,
    shared: Arc<Shared>,
    outbound: Outbound,
    incoming: mpsc::Sender<BoxedIo>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => route(frame, &shared, &outbound, &incoming),
            Some(Err(e)) => {
                debug!(error = %e, "mplex read failed");
                break;
            }
            None => {
                trace!("mplex connection reached eof");
                break;
            }
        }
    }
    shared.closed.cancel();
    shared.reset_all();
}

fn route(
    frame: Frame,
    shared: &Arc<Shared>,
    outbound: &Outbound,
    incoming: &mpsc::Sender<BoxedIo>,
) {
    let key = StreamKey {
        id: frame.stream_id,
        local: !frame.flag.from_initiator(),
    };
    match frame.flag {
        Flag::NewStream => {
            if shared.lock().contains_key(&key) {
                debug!(stream_id = key.id, "ignoring duplicate stream id");
                return;
            }
            let stream = shared.register(key, outbound);
            // A refused stream is dropped here, which resets it.
            if incoming.try_send(Box::new(stream)).is_err() {
                debug!(stream_id = key.id, "inbound stream backlog full, resetting");
            }
        }
        Flag::MessageInitiator | Flag::MessageReceiver => {
            let mut streams = shared.lock();
            let Some(slot) = streams.get(&key) else {
                trace!(stream_id = key.id, "data for unknown stream");
                return;
            };
            let len = frame.payload.len();
            if slot.unread.fetch_add(len, Ordering::AcqRel) + len > MAX_STREAM_BUFFER {
                debug!(stream_id = key.id, "stream buffer full, resetting");
                if let Some(slot) = streams.remove(&key) {
                    slot.reset.store(true, Ordering::Release);
                }
                let _ = outbound
                    .control
                    .send(Frame::new(key.id, key.reset_flag(), Bytes::new()));
                return;
            }
            // The handle may already be gone; its drop sent a reset.
            let _ = slot.inbound.send(frame.payload);
        }
        Flag::CloseInitiator | Flag::CloseReceiver => {
            // Dropping the sender ends the read side once buffered data is consumed.
            shared.remove(key);
        }
        Flag::ResetInitiator | Flag::ResetReceiver => {
            if let Some(slot) = shared.remove(key) {
                slot.reset.store(true, Ordering::Release);
            }
        }
    }
}

async fn write_loop(
    mut sink: FramedWrite<WriteHalf<BoxedIo>, MplexCodec>,
    shared: Arc<Shared>,
    mut control: mpsc::UnboundedReceiver<Frame>,
    mut data: mpsc::Receiver<Frame>,
) {
    let mut interrupted = false;
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            Some(frame) = control.recv() => frame,
            Some(frame) = data.recv() => frame,
            else => break,
        };
        let sent = tokio::select! {
            _ = shared.closed.cancelled() => {
                interrupted = true;
                break;
            }
            sent = sink.send(frame) => sent,
        };
        if let Err(e) = sent {
            debug!(error = %e, "mplex write failed");
            interrupted = true;
            break;
        }
    }
    shared.closed.cancel();
    if interrupted {
        return;
    }
    // Deliver whatever was queued before the close, then shut the write side.
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Ok(frame) = control.try_recv().or_else(|_| data.try_recv()) {
            if sink.feed(frame).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    })
    .await;
}

// ─── Stream ──────────────────────────────────────────────────────────────────

/// One logical stream inside an mplex session.
///
/// Shutting down the write side sends a close frame (half-close). Dropping
/// the handle before both sides have closed resets the stream.
pub struct MplexStream {
    key: StreamKey,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    buffered: Bytes,
    unread: Arc<AtomicUsize>,
    reset: Arc<AtomicBool>,
    read_closed: bool,
    write_closed: bool,
    sink: PollSender<Frame>,
    outbound: Outbound,
    shared: Arc<Shared>,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

impl AsyncRead for MplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.buffered.is_empty() {
                let n = this.buffered.len().min(buf.remaining());
                buf.put_slice(&this.buffered[..n]);
                this.buffered.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => {
                    this.unread.fetch_sub(chunk.len(), Ordering::AcqRel);
                    this.buffered = chunk;
                }
                None => {
                    this.read_closed = true;
                    if this.reset.load(Ordering::Acquire) {
                        return Poll::Ready(Err(reset_error()));
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for MplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.reset.load(Ordering::Acquire) {
            return Poll::Ready(Err(reset_error()));
        }
        if this.write_closed || this.shared.closed.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed for writing",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.sink.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(closed_error()));
        }
        let n = buf.len().min(MAX_WRITE_CHUNK);
        let frame = Frame::new(
            this.key.id,
            this.key.message_flag(),
            Bytes::copy_from_slice(&buf[..n]),
        );
        if this.sink.send_item(frame).is_err() {
            return Poll::Ready(Err(closed_error()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            // A closed session has nothing left to tell the peer.
            if ready!(this.sink.poll_reserve(cx)).is_ok() {
                let close = Frame::new(this.key.id, this.key.close_flag(), Bytes::new());
                let _ = this.sink.send_item(close);
            }
            this.write_closed = true;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MplexStream {
    fn drop(&mut self) {
        self.shared.remove(self.key);
        let finished = self.read_closed && self.write_closed;
        if !finished && !self.reset.load(Ordering::Acquire) {
            self.outbound
                .push(Frame::new(self.key.id, self.key.reset_flag(), Bytes::new()));
        }
    }
}
