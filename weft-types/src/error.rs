use thiserror::Error;

/// Errors raised while decoding identities or addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    #[error("invalid key material: {reason}")]
    InvalidKey { reason: String },

    #[error("invalid multiaddr '{addr}': {reason}")]
    InvalidMultiaddr { addr: String, reason: String },

    #[error("invalid peer id '{id}': {reason}")]
    InvalidPeerId { id: String, reason: String },
}
