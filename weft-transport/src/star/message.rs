use borsh::{BorshDeserialize, BorshSerialize};
use tokio::io::{AsyncRead, AsyncWrite};
use weft_switch::codec::{read_framed, write_framed};
use weft_switch::TransportError;

/// Largest control message accepted from either side.
pub const MAX_STAR_MESSAGE: usize = 256 * 1024;

/// Control messages exchanged with a [`StarServer`](super::server::StarServer).
///
/// The first message on every connection decides its role: `Join` opens a
/// member's control channel, `Connect` asks to be spliced to a member, and
/// `Accept` answers an `Incoming` with a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum StarMessage {
    // Client to server.
    Join { peer: String },
    Connect { target: String, from: String },
    Accept { token: u64 },

    // Server to client.
    Peers { peers: Vec<String> },
    Joined { peer: String },
    Left { peer: String },
    Incoming { token: u64, from: String },
    Ready,
    Rejected { reason: String },
}

pub async fn read_message<T>(io: &mut T) -> Result<StarMessage, TransportError>
where
    T: AsyncRead + Unpin,
{
    Ok(read_framed(io, MAX_STAR_MESSAGE).await?)
}

pub async fn write_message<T>(io: &mut T, msg: &StarMessage) -> Result<(), TransportError>
where
    T: AsyncWrite + Unpin,
{
    Ok(write_framed(io, msg, MAX_STAR_MESSAGE).await?)
}
