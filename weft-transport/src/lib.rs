//! Transports for the weft switch.
//!
//! - [`MemoryTransport`]: in-process pipes addressed as `/memory/<port>`.
//! - [`TcpTransport`]: plain `/ip4|ip6/<host>/tcp/<port>`.
//! - [`StarTransport`]: peers rendezvous at a [`StarServer`], which announces
//!   members to each other and splices connections between them.

pub mod memory;
pub mod star;
pub mod tcp;

pub use memory::{MemoryHub, MemoryTransport};
pub use star::server::StarServer;
pub use star::{StarDiscovery, StarKind, StarTransport};
pub use tcp::TcpTransport;
