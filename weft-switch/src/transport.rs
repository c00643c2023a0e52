use std::sync::Arc;

use async_trait::async_trait;
use weft_types::Multiaddr;

use crate::error::{SwitchError, TransportError};
use crate::io::BoxedIo;

/// An accepted raw connection.
pub struct Incoming {
    pub io: BoxedIo,
    /// Address of the remote end as seen by the transport.
    pub remote_addr: Multiaddr,
}

/// A way of reaching peers at some family of addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this transport understands the address.
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Open a raw connection.
    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError>;

    /// Start accepting connections on an address.
    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError>;
}

/// A bound listener. Dropping it stops accepting.
#[async_trait]
pub trait Listener: Send {
    /// The address actually bound (port 0 resolved).
    fn local_addr(&self) -> Multiaddr;

    /// Wait for the next connection. `TransportError::Closed` ends the listener.
    async fn accept(&mut self) -> Result<Incoming, TransportError>;
}

type AddrPredicate = Arc<dyn Fn(&Multiaddr) -> bool + Send + Sync>;

#[derive(Clone)]
struct Registration {
    predicate: AddrPredicate,
    transport: Arc<dyn Transport>,
}

/// Ordered set of transports. The first registration whose predicate accepts
/// an address handles it.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    entries: Vec<Registration>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport for the addresses its own `can_dial` accepts.
    pub fn add(&mut self, transport: Arc<dyn Transport>) {
        let t = transport.clone();
        self.register(move |addr| t.can_dial(addr), transport);
    }

    /// Register a transport behind an explicit address predicate.
    pub fn register<F>(&mut self, predicate: F, transport: Arc<dyn Transport>)
    where
        F: Fn(&Multiaddr) -> bool + Send + Sync + 'static,
    {
        self.entries.push(Registration {
            predicate: Arc::new(predicate),
            transport,
        });
    }

    /// The transport responsible for an address.
    pub fn resolve(&self, addr: &Multiaddr) -> Result<Arc<dyn Transport>, SwitchError> {
        self.entries
            .iter()
            .find(|entry| (entry.predicate)(addr))
            .map(|entry| entry.transport.clone())
            .ok_or_else(|| SwitchError::NoTransport { addr: addr.clone() })
    }

    /// Names of the registered transports, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.transport.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::Protocol;

    struct Named(&'static str);

    #[async_trait]
    impl Transport for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn can_dial(&self, addr: &Multiaddr) -> bool {
            matches!(addr.iter().next(), Some(Protocol::Memory(_)))
        }

        async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
            Err(TransportError::UnsupportedAddress { addr: addr.clone() })
        }

        async fn listen(&self, _addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
            Err(TransportError::Closed)
        }
    }

    #[test]
    fn test_first_registered_wins() {
        let mut registry = TransportRegistry::new();
        registry.add(Arc::new(Named("first")));
        registry.add(Arc::new(Named("second")));
        let t = registry.resolve(&"/memory/1".parse().unwrap()).unwrap();
        assert_eq!(t.name(), "first");
        assert_eq!(registry.names(), vec!["first", "second"]);
    }

    #[test]
    fn test_explicit_predicate() {
        let mut registry = TransportRegistry::new();
        registry.register(
            |addr| addr.to_string().starts_with("/memory/9"),
            Arc::new(Named("nines")),
        );
        registry.add(Arc::new(Named("any")));
        assert_eq!(
            registry.resolve(&"/memory/99".parse().unwrap()).unwrap().name(),
            "nines"
        );
        assert_eq!(
            registry.resolve(&"/memory/1".parse().unwrap()).unwrap().name(),
            "any"
        );
    }

    #[test]
    fn test_no_transport() {
        let mut registry = TransportRegistry::new();
        registry.add(Arc::new(Named("memory")));
        let addr: Multiaddr = "/ip4/127.0.0.1/udp/1234".parse().unwrap();
        let result = registry.resolve(&addr);
        assert!(matches!(result, Err(SwitchError::NoTransport { addr: a }) if a == addr));
    }
}
