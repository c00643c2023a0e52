//! Identity exchange run on every new connection, after the protector and
//! before muxer negotiation.
//!
//! Both sides send a `Hello` at once and read the other's, so the exchange
//! costs one round trip regardless of direction.

use borsh::{BorshDeserialize, BorshSerialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use weft_types::constants::MAX_HELLO_SIZE;
use weft_types::{Multiaddr, PeerId};

use crate::codec::{read_framed, write_framed};
use crate::error::SwitchError;

/// What a peer announces about itself when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub peer_id: PeerId,
    pub listen_addrs: Vec<Multiaddr>,
    pub protocols: Vec<String>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct HelloWire {
    peer_id: Vec<u8>,
    listen_addrs: Vec<Vec<u8>>,
    protocols: Vec<String>,
}

impl From<&Hello> for HelloWire {
    fn from(hello: &Hello) -> Self {
        HelloWire {
            peer_id: hello.peer_id.to_bytes(),
            listen_addrs: hello.listen_addrs.iter().map(|a| a.to_vec()).collect(),
            protocols: hello.protocols.clone(),
        }
    }
}

impl TryFrom<HelloWire> for Hello {
    type Error = SwitchError;

    fn try_from(wire: HelloWire) -> Result<Self, Self::Error> {
        let peer_id = PeerId::from_bytes(&wire.peer_id).map_err(|e| SwitchError::Handshake {
            reason: format!("invalid peer id: {}", e),
        })?;
        let mut listen_addrs = Vec::with_capacity(wire.listen_addrs.len());
        for raw in wire.listen_addrs {
            match Multiaddr::try_from(raw) {
                Ok(addr) => listen_addrs.push(addr),
                Err(e) => debug!(peer_id = %peer_id, error = %e, "skipping invalid listen address"),
            }
        }
        Ok(Hello {
            peer_id,
            listen_addrs,
            protocols: wire.protocols,
        })
    }
}

/// Send our hello and receive the remote's.
pub async fn exchange<T>(io: &mut T, local: &Hello) -> Result<Hello, SwitchError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    write_framed(io, &HelloWire::from(local), MAX_HELLO_SIZE)
        .await
        .map_err(|e| SwitchError::Handshake {
            reason: format!("send failed: {}", e),
        })?;
    let wire: HelloWire =
        read_framed(io, MAX_HELLO_SIZE)
            .await
            .map_err(|e| SwitchError::Handshake {
                reason: format!("receive failed: {}", e),
            })?;
    Hello::try_from(wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use weft_types::identity::{keypair_from_seed, peer_id_of};

    fn hello(seed: u8) -> Hello {
        Hello {
            peer_id: peer_id_of(&keypair_from_seed([seed; 32]).unwrap()),
            listen_addrs: vec![format!("/memory/{}", seed).parse().unwrap()],
            protocols: vec!["/echo/1.0.0".to_string()],
        }
    }

    #[tokio::test]
    async fn test_exchange() {
        let (mut a, mut b) = duplex(4096);
        let (ha, hb) = (hello(1), hello(2));
        let hb_clone = hb.clone();
        let remote = tokio::spawn(async move { exchange(&mut b, &hb_clone).await });
        let got_b = exchange(&mut a, &ha).await.unwrap();
        let got_a = remote.await.unwrap().unwrap();
        assert_eq!(got_b, hb);
        assert_eq!(got_a, ha);
    }

    #[tokio::test]
    async fn test_exchange_garbage() {
        let (mut a, mut b) = duplex(4096);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = b.write_all(&[0, 0, 0, 3, 1, 0xff, 0xff]).await;
            // Keep the pipe open until the reader gives up.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });
        let result = exchange(&mut a, &hello(1)).await;
        assert!(matches!(result, Err(SwitchError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_exchange_remote_hangs_up() {
        let (mut a, b) = duplex(4096);
        drop(b);
        assert!(exchange(&mut a, &hello(1)).await.is_err());
    }
}
