//! The weft switch.
//!
//! A [`Switch`](switch::Switch) owns every connection a node has. It dials
//! through pluggable transports, optionally wraps raw connections in a
//! private-network protector, exchanges identities, negotiates a stream muxer,
//! and dispatches inbound streams to registered protocol handlers.

pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod io;
pub mod multistream;
pub mod muxer;
pub mod peer_book;
pub mod protector;
pub mod protocol;
pub mod stream;
pub mod switch;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SwitchConfig;
pub use connection::{Connection, ConnectionState, Direction};
pub use discovery::{Discovery, DiscoverySink};
pub use error::{AddressFailure, DialError, SwitchError, TransportError};
pub use io::BoxedIo;
pub use muxer::mplex::MplexMuxer;
pub use muxer::{MuxedSession, MuxerRegistry, StreamMuxer};
pub use peer_book::PeerBook;
pub use protector::{PreSharedKey, PreSharedKeyProtector, Protector};
pub use protocol::{ProtocolRegistry, StreamHandler};
pub use stream::{Stream, StreamInfo, StreamState};
pub use switch::{Switch, SwitchBuilder, SwitchEvent};
pub use transport::{Incoming, Listener, Transport, TransportRegistry};
