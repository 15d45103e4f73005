//! The relay's three shared directories.
//!
//! A relay keeps one outbound handle per live peer session, one per local
//! client session and a map from every remote client handle to the relay id
//! hosting it. All three are read-mostly maps shared between the session
//! tasks; mutation happens under the lock, lookups clone the stored handle
//! out.
//!
//! The directory is generic over the outbound handle type so the pure logic
//! can be exercised without sockets.

use ahash::AHashMap;
use parking_lot::RwLock;

pub struct Registry<S> {
    peers: RwLock<AHashMap<u64, S>>,
    clients: RwLock<AHashMap<u64, S>>,
    locations: RwLock<AHashMap<u64, u64>>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            peers: RwLock::new(AHashMap::with_capacity(64)),
            clients: RwLock::new(AHashMap::with_capacity(1024)),
            locations: RwLock::new(AHashMap::with_capacity(1024)),
        }
    }
}

impl<S> Registry<S>
where
    S: Clone,
{
    /// Record a peer session. A reconnecting peer replaces its previous
    /// entry, keeping at most one handle per relay id.
    pub fn insert_peer(&self, id: u64, sender: S) {
        self.peers.write().insert(id, sender);
    }

    /// Remove a peer entry, but only while `predicate` accepts the stored
    /// handle. Session tasks pass a check for their own handle so a stale
    /// task cannot evict a fresh reconnect.
    pub fn remove_peer_if(&self, id: u64, predicate: impl FnOnce(&S) -> bool) -> bool {
        let mut peers = self.peers.write();
        if peers.get(&id).is_some_and(|sender| predicate(sender)) {
            peers.remove(&id);
            true
        } else {
            false
        }
    }

    pub fn peer(&self, id: u64) -> Option<S> {
        self.peers.read().get(&id).cloned()
    }

    /// All peer sessions whose relay id is not in `except`.
    pub fn peers_except(&self, except: &[u64]) -> Vec<(u64, S)> {
        self.peers
            .read()
            .iter()
            .filter(|(id, _)| !except.contains(id))
            .map(|(id, sender)| (*id, sender.clone()))
            .collect()
    }

    /// Register a local client session under a fresh random handle.
    ///
    /// Handles are drawn uniformly from the non-zero u64 space; zero stands
    /// for "unused" on the wire. The draw repeats on collision so a handle
    /// is unique within its relay.
    pub fn register_client(&self, sender: S) -> u64 {
        let mut clients = self.clients.write();

        loop {
            let handle = rand::random::<u64>();
            if handle != 0 && !clients.contains_key(&handle) {
                clients.insert(handle, sender);
                return handle;
            }
        }
    }

    pub fn remove_client_if(&self, handle: u64, predicate: impl FnOnce(&S) -> bool) -> bool {
        let mut clients = self.clients.write();
        if clients.get(&handle).is_some_and(|sender| predicate(sender)) {
            clients.remove(&handle);
            true
        } else {
            false
        }
    }

    pub fn client(&self, handle: u64) -> Option<S> {
        self.clients.read().get(&handle).cloned()
    }

    /// Record that `handle` lives on relay `node`.
    ///
    /// Returns false when the handle's location was already known; a
    /// client's hosting relay never changes for the lifetime of the
    /// cluster, so the first announcement wins.
    pub fn learn_location(&self, handle: u64, node: u64) -> bool {
        let mut locations = self.locations.write();
        if locations.contains_key(&handle) {
            return false;
        }

        locations.insert(handle, node);
        true
    }

    /// The relay id hosting `handle`, if gossip has reached us.
    pub fn location(&self, handle: u64) -> Option<u64> {
        self.locations.read().get(&handle).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_entries_are_unique_per_id() {
        let registry: Registry<u32> = Registry::default();

        registry.insert_peer(1, 10);
        registry.insert_peer(1, 11);

        assert_eq!(registry.peer(1), Some(11));
        assert_eq!(registry.peers_except(&[]).len(), 1);
    }

    #[test]
    fn remove_peer_checks_the_stored_handle() {
        let registry: Registry<u32> = Registry::default();
        registry.insert_peer(1, 10);

        assert!(!registry.remove_peer_if(1, |sender| *sender == 11));
        assert_eq!(registry.peer(1), Some(10));

        assert!(registry.remove_peer_if(1, |sender| *sender == 10));
        assert_eq!(registry.peer(1), None);
    }

    #[test]
    fn client_handles_are_fresh_and_non_zero() {
        let registry: Registry<u32> = Registry::default();

        let first = registry.register_client(1);
        let second = registry.register_client(2);

        assert_ne!(first, 0);
        assert_ne!(second, 0);
        assert_ne!(first, second);
        assert_eq!(registry.client(first), Some(1));
        assert_eq!(registry.client(second), Some(2));
    }

    #[test]
    fn first_location_announcement_wins() {
        let registry: Registry<u32> = Registry::default();

        assert!(registry.learn_location(42, 1));
        assert!(!registry.learn_location(42, 2));
        assert_eq!(registry.location(42), Some(1));
    }

    #[test]
    fn peers_except_filters_visited_ids() {
        let registry: Registry<u32> = Registry::default();
        registry.insert_peer(1, 10);
        registry.insert_peer(2, 20);
        registry.insert_peer(3, 30);

        let mut remaining: Vec<u64> = registry
            .peers_except(&[1, 3])
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        remaining.sort_unstable();

        assert_eq!(remaining, vec![2]);
    }
}
