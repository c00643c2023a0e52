use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::stream::Stream;

/// Handles inbound streams that negotiated a registered protocol.
///
/// Any `Fn(String, Stream) -> impl Future<Output = ()>` closure qualifies.
/// Each stream's future is spawned on its own task.
pub trait StreamHandler: Send + Sync + 'static {
    fn call(&self, protocol: String, stream: Stream) -> BoxFuture<'static, ()>;
}

impl<F, Fut> StreamHandler for F
where
    F: Fn(String, Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, protocol: String, stream: Stream) -> BoxFuture<'static, ()> {
        Box::pin(self(protocol, stream))
    }
}

type ProtocolPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
enum Matcher {
    Exact,
    Predicate(ProtocolPredicate),
}

#[derive(Clone)]
struct Registration {
    protocol: String,
    matcher: Matcher,
    handler: Arc<dyn StreamHandler>,
}

impl Registration {
    fn matches(&self, proposed: &str) -> bool {
        match &self.matcher {
            Matcher::Exact => self.protocol == proposed,
            Matcher::Predicate(predicate) => predicate(proposed),
        }
    }
}

/// Protocol handlers in registration order.
///
/// A proposed protocol goes to the first registration that matches it.
/// Registering an id that is already present replaces that entry in place.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    entries: Vec<Registration>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for exactly `protocol`.
    pub fn handle(&mut self, protocol: impl Into<String>, handler: Arc<dyn StreamHandler>) {
        self.insert(Registration {
            protocol: protocol.into(),
            matcher: Matcher::Exact,
            handler,
        });
    }

    /// Register a handler for every proposal `predicate` accepts.
    ///
    /// `protocol` names the registration for `unhandle` and listings.
    pub fn handle_with_matcher<P>(
        &mut self,
        protocol: impl Into<String>,
        predicate: P,
        handler: Arc<dyn StreamHandler>,
    ) where
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.insert(Registration {
            protocol: protocol.into(),
            matcher: Matcher::Predicate(Arc::new(predicate)),
            handler,
        });
    }

    fn insert(&mut self, registration: Registration) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.protocol == registration.protocol)
        {
            Some(existing) => *existing = registration,
            None => self.entries.push(registration),
        }
    }

    /// Remove a registration. Returns `true` if it existed.
    pub fn unhandle(&mut self, protocol: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.protocol != protocol);
        self.entries.len() != before
    }

    /// The handler for a proposed protocol.
    pub fn resolve(&self, proposed: &str) -> Option<Arc<dyn StreamHandler>> {
        self.entries
            .iter()
            .find(|e| e.matches(proposed))
            .map(|e| e.handler.clone())
    }

    pub fn supports(&self, proposed: &str) -> bool {
        self.entries.iter().any(|e| e.matches(proposed))
    }

    /// Registered protocol ids, in registration order.
    pub fn protocols(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.protocol.clone()).collect()
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that records which registration served a call.
    fn tagged(tag: usize, hits: Arc<AtomicUsize>) -> Arc<dyn StreamHandler> {
        Arc::new(move |_protocol: String, _stream: Stream| {
            let hits = hits.clone();
            async move {
                hits.store(tag, Ordering::SeqCst);
            }
        })
    }

    fn same_handler(a: &Arc<dyn StreamHandler>, b: &Arc<dyn StreamHandler>) -> bool {
        Arc::ptr_eq(a, b)
    }

    #[test]
    fn test_exact_match() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ProtocolRegistry::new();
        registry.handle("/echo/1.0.0", tagged(1, hits.clone()));
        assert!(registry.supports("/echo/1.0.0"));
        assert!(!registry.supports("/echo/2.0.0"));
        assert!(registry.resolve("/echo/1.0.0").is_some());
    }

    #[test]
    fn test_reregistration_replaces_in_place() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ProtocolRegistry::new();
        registry.handle("/a", tagged(1, hits.clone()));
        registry.handle("/b", tagged(2, hits.clone()));
        let replacement = tagged(3, hits.clone());
        registry.handle("/a", replacement.clone());

        assert_eq!(registry.protocols(), vec!["/a", "/b"]);
        let resolved = registry.resolve("/a").unwrap();
        assert!(same_handler(&resolved, &replacement));
    }

    #[test]
    fn test_predicate_match_in_registration_order() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ProtocolRegistry::new();
        let first = tagged(1, hits.clone());
        let second = tagged(2, hits.clone());
        registry.handle_with_matcher("/chat", |p| p.starts_with("/chat/"), first.clone());
        registry.handle_with_matcher("/any", |_| true, second.clone());

        assert!(same_handler(&registry.resolve("/chat/2.0.0").unwrap(), &first));
        assert!(same_handler(&registry.resolve("/other").unwrap(), &second));
    }

    #[test]
    fn test_unhandle() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ProtocolRegistry::new();
        registry.handle("/a", tagged(1, hits));
        assert!(registry.unhandle("/a"));
        assert!(!registry.unhandle("/a"));
        assert!(registry.resolve("/a").is_none());
        assert!(registry.is_empty());
    }
}
