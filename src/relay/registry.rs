use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::TcpStream;

/// Relay-local subscriber identifier. Never reused within one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One long-lived replica connection. Dropping it closes the stream.
#[derive(Debug)]
pub struct Subscriber<S = TcpStream> {
    id: SubscriberId,
    peer: SocketAddr,
    connected_at: Instant,
    pub(crate) stream: S,
}

impl<S> Subscriber<S> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

/// Live subscriber set, owned by the relay control task.
#[derive(Debug)]
pub struct Registry<S = TcpStream> {
    next_id: u64,
    subscribers: HashMap<SubscriberId, Subscriber<S>>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscribers: HashMap::new(),
        }
    }
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted stream and return its id
    pub fn insert(&mut self, stream: S, peer: SocketAddr) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.insert(
            id,
            Subscriber {
                id,
                peer,
                connected_at: Instant::now(),
                stream,
            },
        );
        id
    }

    /// Remove a subscriber; the caller decides when the stream is dropped
    pub fn remove(&mut self, id: SubscriberId) -> Option<Subscriber<S>> {
        self.subscribers.remove(&id)
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Traversal for broadcast; order is unspecified
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscriber<S>> {
        self.subscribers.values_mut()
    }

    /// Drop every subscriber, closing their streams
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let mut registry: Registry<()> = Registry::new();
        let a = registry.insert((), peer());
        let b = registry.insert((), peer());
        assert_ne!(a, b);

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        let c = registry.insert((), peer());

        assert_ne!(c, a);
        assert!(!registry.contains(a));
        assert!(registry.contains(b) && registry.contains(c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn traversal_visits_every_member() {
        let mut registry: Registry<u32> = Registry::new();
        for n in 0..5 {
            registry.insert(n, peer());
        }

        let mut seen: Vec<u32> = registry.iter_mut().map(|s| s.stream).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        registry.clear();
        assert!(registry.is_empty());
    }
}
