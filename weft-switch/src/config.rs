use std::time::Duration;

use weft_types::constants::{
    DEFAULT_DIAL_TIMEOUT, DEFAULT_EVENT_CAPACITY, DEFAULT_NEGOTIATION_TIMEOUT,
};

/// Switch tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Bound on one transport-level connect.
    pub dial_timeout: Duration,
    /// Bound on a connection upgrade and on each stream's protocol negotiation.
    pub negotiation_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
