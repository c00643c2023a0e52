use std::time::Duration;

// ─── Protocol Identifiers ────────────────────────────────────────────────────

/// Header exchanged before every multistream negotiation.
pub const MULTISTREAM_PROTOCOL: &str = "/multistream/1.0.0";

/// The built-in stream multiplexer.
pub const MPLEX_PROTOCOL: &str = "/mplex/6.7.0";

/// Identity exchange performed right after the transport connects.
pub const HELLO_PROTOCOL: &str = "/weft/hello/1.0.0";

/// Echo protocol served by the CLI node and used throughout the tests.
pub const ECHO_PROTOCOL: &str = "/echo/1.0.0";

// ─── Size Limits ─────────────────────────────────────────────────────────────

/// Largest multistream message (protocol id plus newline).
pub const MAX_NEGOTIATION_MESSAGE: usize = 1024;

/// Largest hello message accepted from a remote.
pub const MAX_HELLO_SIZE: usize = 64 * 1024;

/// Largest muxer frame payload accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MB

/// Writes larger than this are split across several muxer frames.
pub const MAX_WRITE_CHUNK: usize = 64 * 1024;

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Default bound on a single transport-level connect.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on connection upgrades and per-stream protocol negotiation.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the switch and node event channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
