use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;
use weft_switch::{BoxedIo, Incoming, Listener, Transport, TransportError};
use weft_types::address::{from_socket_addr, is_tcp_addr, socket_addr_of};
use weft_types::Multiaddr;

/// Plain TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        is_tcp_addr(addr)
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
        let socket_addr = socket_addr_of(addr).ok_or_else(|| TransportError::UnsupportedAddress {
            addr: addr.clone(),
        })?;
        let stream = TcpStream::connect(socket_addr).await?;
        stream.set_nodelay(self.nodelay)?;
        debug!(addr = %socket_addr, "tcp connected");
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let socket_addr = socket_addr_of(addr).ok_or_else(|| TransportError::UnsupportedAddress {
            addr: addr.clone(),
        })?;
        let listener = TcpListener::bind(socket_addr).await?;
        let local_addr = from_socket_addr(listener.local_addr()?);
        Ok(Box::new(TcpListenerStream {
            listener,
            local_addr,
            nodelay: self.nodelay,
        }))
    }
}

struct TcpListenerStream {
    listener: TcpListener,
    local_addr: Multiaddr,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpListenerStream {
    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    async fn accept(&mut self) -> Result<Incoming, TransportError> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(Incoming {
            io: Box::new(stream),
            remote_addr: from_socket_addr(remote),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_can_dial() {
        let tcp = TcpTransport::new();
        assert!(tcp.can_dial(&"/ip4/127.0.0.1/tcp/4001".parse().unwrap()));
        assert!(!tcp.can_dial(&"/ip4/127.0.0.1/tcp/4001/ws".parse().unwrap()));
        assert!(!tcp.can_dial(&"/memory/1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_listen_on_ephemeral_port() {
        let tcp = TcpTransport::new();
        let mut listener = tcp
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        assert_ne!(socket_addr_of(&addr).unwrap().port(), 0);

        let mut client = tcp.dial(&addr).await.unwrap();
        let mut incoming = listener.accept().await.unwrap();
        client.write_all(b"tcp!").await.unwrap();
        let mut buf = [0u8; 4];
        incoming.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tcp!");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let tcp = TcpTransport::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = from_socket_addr(listener.local_addr().unwrap());
        drop(listener);
        assert!(tcp.dial(&addr).await.is_err());
    }
}
