//! Private-network protection.
//!
//! Members of a private network share a 32-byte key. Every raw connection is
//! wrapped before anything else is exchanged: each side sends a random 24-byte
//! nonce, then everything it writes is run through XChaCha20 keyed by the
//! shared key and its own nonce. Peers holding a different key (or none) read garbage and
//! fail the identity handshake that follows.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::SwitchError;
use crate::io::BoxedIo;

/// First line of a swarm key file.
pub const SWARM_KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";
/// Second line of a swarm key file: the key encoding.
pub const SWARM_KEY_ENCODING: &str = "/base16/";

const NONCE_LEN: usize = 24;

// ─── PreSharedKey ────────────────────────────────────────────────────────────

/// A private-network key.
#[derive(Clone, PartialEq, Eq)]
pub struct PreSharedKey([u8; 32]);

impl PreSharedKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// A fresh random key.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short identifier that is safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.0);
        hex::encode(&digest.as_bytes()[..8])
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreSharedKey({})", self.fingerprint())
    }
}

/// Formats as a swarm key file.
impl fmt::Display for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", SWARM_KEY_HEADER)?;
        writeln!(f, "{}", SWARM_KEY_ENCODING)?;
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Parses the swarm key file format.
impl FromStr for PreSharedKey {
    type Err = SwitchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lines = s.lines().map(str::trim).filter(|l| !l.is_empty());
        let invalid = |reason: String| SwitchError::Protector { reason };

        match lines.next() {
            Some(SWARM_KEY_HEADER) => {}
            other => {
                return Err(invalid(format!(
                    "expected header {}, got {:?}",
                    SWARM_KEY_HEADER, other
                )))
            }
        }
        match lines.next() {
            Some(SWARM_KEY_ENCODING) => {}
            other => {
                return Err(invalid(format!(
                    "unsupported key encoding {:?}, expected {}",
                    other, SWARM_KEY_ENCODING
                )))
            }
        }
        let key_hex = lines
            .next()
            .ok_or_else(|| invalid("missing key material".to_string()))?;
        let bytes =
            hex::decode(key_hex).map_err(|e| invalid(format!("invalid key hex: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| invalid(format!("key must be 32 bytes, got {}", b.len())))?;
        Ok(Self(key))
    }
}

// ─── Protector ───────────────────────────────────────────────────────────────

/// Wraps raw connections before any other exchange.
#[async_trait]
pub trait Protector: Send + Sync {
    async fn protect(&self, io: BoxedIo) -> Result<BoxedIo, SwitchError>;
}

/// Protector backed by a pre-shared key.
#[derive(Debug, Clone)]
pub struct PreSharedKeyProtector {
    key: PreSharedKey,
}

impl PreSharedKeyProtector {
    pub fn new(key: PreSharedKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &PreSharedKey {
        &self.key
    }

    fn cipher(&self, nonce: &[u8; NONCE_LEN]) -> XChaCha20 {
        XChaCha20::new(
            Key::from_slice(self.key.as_bytes()),
            XNonce::from_slice(nonce),
        )
    }
}

#[async_trait]
impl Protector for PreSharedKeyProtector {
    async fn protect(&self, mut io: BoxedIo) -> Result<BoxedIo, SwitchError> {
        let fail = |e: io::Error| SwitchError::Protector {
            reason: format!("nonce exchange failed: {}", e),
        };

        let local_nonce: [u8; NONCE_LEN] = rand::random();
        io.write_all(&local_nonce).await.map_err(fail)?;
        io.flush().await.map_err(fail)?;

        let mut remote_nonce = [0u8; NONCE_LEN];
        io.read_exact(&mut remote_nonce).await.map_err(fail)?;

        Ok(Box::new(PnetStream::new(
            io,
            self.cipher(&remote_nonce),
            self.cipher(&local_nonce),
        )))
    }
}

// ─── PnetStream ──────────────────────────────────────────────────────────────

/// A stream encrypted with one XChaCha20 keystream per direction.
///
/// Encrypted bytes that the inner writer has not taken yet are kept in
/// `pending` and drained before any new data is accepted.
pub struct PnetStream<S> {
    inner: S,
    read_cipher: XChaCha20,
    write_cipher: XChaCha20,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> PnetStream<S> {
    fn new(inner: S, read_cipher: XChaCha20, write_cipher: XChaCha20) -> Self {
        Self {
            inner,
            read_cipher,
            write_cipher,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }
}

impl<S: AsyncWrite + Unpin> PnetStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PnetStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.read_cipher
            .apply_keystream(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PnetStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.pending.extend_from_slice(buf);
        this.write_cipher.apply_keystream(&mut this.pending);
        // The bytes are committed; whatever the inner writer refuses now is
        // drained on the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
