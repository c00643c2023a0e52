//! Versioned, length-prefixed borsh framing.
//!
//! Wire format: `[4-byte BE length][1-byte version][borsh payload]`. The
//! length covers the version byte plus the payload.

use std::io;

use borsh::{BorshDeserialize, BorshSerialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current framing version.
pub const FRAME_VERSION: u8 = 1;

/// Read one framed message, rejecting anything larger than `max_size`.
pub async fn read_framed<M, T>(io: &mut T, max_size: usize) -> io::Result<M>
where
    M: BorshDeserialize,
    T: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {} bytes (max {})", len, max_size),
        ));
    }
    if len < 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message too short: missing version byte",
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    let version = buf[0];
    if version != FRAME_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame version mismatch: peer sent v{}, we run v{}",
                version, FRAME_VERSION
            ),
        ));
    }

    M::try_from_slice(&buf[1..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write and flush one framed message.
pub async fn write_framed<M, T>(io: &mut T, msg: &M, max_size: usize) -> io::Result<()>
where
    M: BorshSerialize,
    T: AsyncWrite + Unpin,
{
    let data = borsh::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if data.len() + 1 > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {} bytes (max {})", data.len() + 1, max_size),
        ));
    }

    let mut out = Vec::with_capacity(4 + 1 + data.len());
    out.extend_from_slice(&((1 + data.len()) as u32).to_be_bytes());
    out.push(FRAME_VERSION);
    out.extend_from_slice(&data);
    io.write_all(&out).await?;
    io.flush().await
}
