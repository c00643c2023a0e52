//! Shared types for the weft peer-to-peer switch.
//!
//! Peer identities and multiaddresses are the `libp2p` types; this crate adds
//! the peer record (`PeerInfo`) the switch and node accumulate over their
//! lifetime, dial targets, and a handful of address helpers.

pub mod address;
pub mod constants;
pub mod error;
pub mod identity;
pub mod peer;

pub use libp2p::multiaddr::Protocol;
pub use libp2p::{Multiaddr, PeerId};
pub use peer::{DialTarget, MultiaddrSet, PeerInfo};
