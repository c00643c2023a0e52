use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream the switch can move between tasks.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased byte stream produced by transports, protectors, and muxers.
pub type BoxedIo = Box<dyn Io>;
