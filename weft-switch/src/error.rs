use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;
use weft_types::{Multiaddr, PeerId};

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("address not supported by transport: {addr}")]
    UnsupportedAddress { addr: Multiaddr },

    #[error("rejected by remote: {reason}")]
    Rejected { reason: String },

    #[error("listener closed")]
    Closed,

    #[error("io error: {reason}")]
    Io { reason: String },
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io {
            reason: e.to_string(),
        }
    }
}

/// Why one candidate address could not be dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressFailure {
    pub addr: Multiaddr,
    pub error: Box<SwitchError>,
}

/// Every candidate address of a dial failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialError {
    pub peer: Option<PeerId>,
    pub failures: Vec<AddressFailure>,
}

impl DialError {
    /// True when no candidate address had a matching transport.
    pub fn all_no_transport(&self) -> bool {
        self.failures
            .iter()
            .all(|f| matches!(*f.error, SwitchError::NoTransport { .. }))
    }
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer {
            Some(peer) => write!(f, "failed to dial {}: ", peer)?,
            None => write!(f, "failed to dial: ")?,
        }
        write!(f, "all {} addresses failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.addr, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for DialError {}

/// Errors raised by the switch and its upgrade pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("no transport for address: {addr}")]
    NoTransport { addr: Multiaddr },

    #[error("no known addresses for peer {peer}")]
    NoAddresses { peer: PeerId },

    #[error("{0}")]
    Dial(DialError),

    #[error("could not listen on {addr}: {reason}")]
    TransportBind { addr: Multiaddr, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol not supported: {protocol}")]
    ProtocolNotSupported { protocol: String },

    #[error("negotiation failed: {reason}")]
    NegotiationFailed { reason: String },

    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    #[error("refusing to connect to self")]
    DialSelf,

    #[error("private network protector failed: {reason}")]
    Protector { reason: String },

    #[error("muxer error: {reason}")]
    Muxer { reason: String },

    #[error("connection to {peer} is closed")]
    ConnectionClosed { peer: PeerId },

    #[error("not started")]
    NotStarted,

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("io error: {reason}")]
    Io { reason: String },
}

impl From<io::Error> for SwitchError {
    fn from(e: io::Error) -> Self {
        SwitchError::Io {
            reason: e.to_string(),
        }
    }
}

impl From<DialError> for SwitchError {
    fn from(e: DialError) -> Self {
        SwitchError::Dial(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_error_display_lists_failures() {
        let err = DialError {
            peer: None,
            failures: vec![
                AddressFailure {
                    addr: "/memory/1".parse().unwrap(),
                    error: Box::new(SwitchError::Io {
                        reason: "connection refused".to_string(),
                    }),
                },
                AddressFailure {
                    addr: "/ip4/1.2.3.4/udp/1".parse().unwrap(),
                    error: Box::new(SwitchError::NoTransport {
                        addr: "/ip4/1.2.3.4/udp/1".parse().unwrap(),
                    }),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("all 2 addresses failed"));
        assert!(text.contains("/memory/1: io error: connection refused"));
        assert!(!err.all_no_transport());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: SwitchError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, SwitchError::Io { .. }));
        let err: TransportError = io::Error::new(io::ErrorKind::ConnectionRefused, "no").into();
        assert_eq!(
            err,
            TransportError::Io {
                reason: "no".to_string()
            }
        );
    }
}
