//! Multistream-style protocol selection.
//!
//! Each message is `[2-byte BE length][utf-8 text]['\n']`, where the length
//! counts the newline. Both sides first exchange the multistream header, then
//! the dialer proposes protocols one at a time and the listener echoes the
//! accepted one or answers `na`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use weft_types::constants::{MAX_NEGOTIATION_MESSAGE, MULTISTREAM_PROTOCOL};

use crate::error::SwitchError;

const NOT_AVAILABLE: &str = "na";

async fn write_message<T>(io: &mut T, message: &str) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    let len = message.len() + 1;
    if len > MAX_NEGOTIATION_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("negotiation message too large: {} bytes", len),
        ));
    }
    let mut frame = Vec::with_capacity(2 + len);
    frame.extend_from_slice(&(len as u16).to_be_bytes());
    frame.extend_from_slice(message.as_bytes());
    frame.push(b'\n');
    io.write_all(&frame).await?;
    io.flush().await
}

async fn read_message<T>(io: &mut T) -> io::Result<String>
where
    T: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    io.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_NEGOTIATION_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid negotiation message length: {}", len),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "negotiation message missing newline",
        ));
    }
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn exchange_header<T>(io: &mut T) -> Result<(), SwitchError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    write_message(io, MULTISTREAM_PROTOCOL).await?;
    let header = read_message(io).await?;
    if header != MULTISTREAM_PROTOCOL {
        return Err(SwitchError::NegotiationFailed {
            reason: format!("unexpected header '{}'", header),
        });
    }
    Ok(())
}

/// Propose `protocols` in order and return the first one the listener accepts.
///
/// Fails with `ProtocolNotSupported` when every proposal is refused.
pub async fn dialer_select<T>(io: &mut T, protocols: &[String]) -> Result<String, SwitchError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    exchange_header(io).await?;
    for protocol in protocols {
        write_message(io, protocol).await?;
        let reply = read_message(io).await?;
        if reply == *protocol {
            return Ok(reply);
        }
        if reply != NOT_AVAILABLE {
            return Err(SwitchError::NegotiationFailed {
                reason: format!("unexpected reply '{}' to '{}'", reply, protocol),
            });
        }
    }
    Err(SwitchError::ProtocolNotSupported {
        protocol: protocols.join(", "),
    })
}

/// Answer proposals until `accept` approves one, then return it.
///
/// Refused proposals are answered with `na`; the loop ends when the dialer
/// gives up and closes the stream.
pub async fn listener_select<T, F>(io: &mut T, mut accept: F) -> Result<String, SwitchError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&str) -> bool,
{
    exchange_header(io).await?;
    loop {
        let proposal = read_message(io).await?;
        if accept(&proposal) {
            write_message(io, &proposal).await?;
            return Ok(proposal);
        }
        write_message(io, NOT_AVAILABLE).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_select_first_supported() {
        let (mut a, mut b) = duplex(1024);
        let listener = tokio::spawn(async move {
            listener_select(&mut b, |p| p == "/b/1.0.0").await
        });
        let chosen = dialer_select(&mut a, &["/a/1.0.0".to_string(), "/b/1.0.0".to_string()])
            .await
            .unwrap();
        assert_eq!(chosen, "/b/1.0.0");
        assert_eq!(listener.await.unwrap().unwrap(), "/b/1.0.0");
    }

    #[tokio::test]
    async fn test_select_none_supported() {
        let (mut a, mut b) = duplex(1024);
        let listener = tokio::spawn(async move { listener_select(&mut b, |_| false).await });
        let result = dialer_select(&mut a, &["/x/1.0.0".to_string()]).await;
        assert!(matches!(result, Err(SwitchError::ProtocolNotSupported { .. })));
        drop(a);
        // The listener sees the dialer hang up.
        assert!(listener.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bad_header() {
        let (mut a, mut b) = duplex(1024);
        tokio::spawn(async move {
            let _ = write_message(&mut b, "/not-multistream").await;
            let _ = read_message(&mut b).await;
        });
        let result = dialer_select(&mut a, &["/x/1.0.0".to_string()]).await;
        assert!(matches!(result, Err(SwitchError::NegotiationFailed { .. })));
    }

    #[tokio::test]
    async fn test_message_framing() {
        let (mut a, mut b) = duplex(1024);
        write_message(&mut a, "/echo/1.0.0").await.unwrap();
        let mut raw = [0u8; 2];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(u16::from_be_bytes(raw), 12);
        let mut rest = vec![0u8; 12];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"/echo/1.0.0\n");
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut a, _b) = duplex(4096);
        let huge = "x".repeat(MAX_NEGOTIATION_MESSAGE);
        assert!(write_message(&mut a, &huge).await.is_err());
    }
}
