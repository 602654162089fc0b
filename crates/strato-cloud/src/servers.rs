//! Per-federated-peer bookkeeping.
//!
//! Each peer server advertises the keys it holds uploaded and the keys it
//! wants change notifications for. Until a peer's handshake snapshot
//! arrives its advertisements are unknown, so every query fan-out must
//! include it.

use std::collections::{BTreeMap, BTreeSet};

use strato_core::{CloudKey, PeerAddress, PeerGuid};

/// Synchronization state of a federated peer.
///
/// A peer enters the registry as `HandshakeInFlight` when our snapshot is
/// sent, and becomes `Synchronized` when its snapshot arrives. A
/// disconnected peer is removed from the registry entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSyncState {
    /// Snapshot exchange is still in flight; advertisements unknown.
    HandshakeInFlight,
    /// The peer's key sets are known and maintained incrementally.
    Synchronized,
}

/// State kept for one federated peer server.
#[derive(Debug, Clone)]
pub struct RemoteServer {
    /// The peer's guid.
    pub server_guid: PeerGuid,
    /// The peer's transport address.
    pub server_address: PeerAddress,
    /// Keys the peer advertises as uploaded.
    pub uploaded_keys: BTreeSet<CloudKey>,
    /// Keys the peer wants change notifications for.
    pub subscribed_keys: BTreeSet<CloudKey>,
    /// Whether the peer's snapshot has arrived.
    pub sync_state: PeerSyncState,
    /// Scratch used while computing a fan-out candidate set.
    working_flag: bool,
}

impl RemoteServer {
    /// Creates a fresh entry for a peer whose snapshot is outstanding.
    pub fn new(server_guid: PeerGuid, server_address: PeerAddress) -> Self {
        Self {
            server_guid,
            server_address,
            uploaded_keys: BTreeSet::new(),
            subscribed_keys: BTreeSet::new(),
            sync_state: PeerSyncState::HandshakeInFlight,
            working_flag: false,
        }
    }

    /// True once the peer's snapshot has arrived.
    pub fn is_synchronized(&self) -> bool {
        self.sync_state == PeerSyncState::Synchronized
    }
}

/// Registry of federated peers, enumerated in guid order.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<PeerGuid, RemoteServer>,
}

impl ServerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the guid names a registered peer.
    pub fn contains(&self, guid: &PeerGuid) -> bool {
        self.servers.contains_key(guid)
    }

    /// Returns the peer entry, if present.
    pub fn get(&self, guid: &PeerGuid) -> Option<&RemoteServer> {
        self.servers.get(guid)
    }

    /// Returns the peer entry mutably, if present.
    pub fn get_mut(&mut self, guid: &PeerGuid) -> Option<&mut RemoteServer> {
        self.servers.get_mut(guid)
    }

    /// Inserts a peer entry. Returns false if the guid was already present.
    pub fn insert(&mut self, server: RemoteServer) -> bool {
        if self.servers.contains_key(&server.server_guid) {
            return false;
        }
        self.servers.insert(server.server_guid, server);
        true
    }

    /// Removes and returns the peer entry.
    pub fn remove(&mut self, guid: &PeerGuid) -> Option<RemoteServer> {
        self.servers.remove(guid)
    }

    /// Guids of all registered peers, in guid order.
    pub fn guids(&self) -> Vec<PeerGuid> {
        self.servers.keys().copied().collect()
    }

    /// Iterates all peer entries in guid order.
    pub fn iter(&self) -> impl Iterator<Item = &RemoteServer> {
        self.servers.values()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// True if no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Computes the fan-out candidate set for a query over `keys`.
    ///
    /// A peer is a candidate when its snapshot has not arrived (its
    /// advertisements are unknown, so it must be consulted) or when it
    /// advertises any of the queried keys as uploaded.
    pub fn fanout_candidates(&mut self, keys: &[CloudKey]) -> Vec<PeerGuid> {
        for server in self.servers.values_mut() {
            server.working_flag = false;
        }

        let mut candidates = Vec::new();
        for server in self.servers.values_mut() {
            if server.working_flag {
                continue;
            }
            if !server.is_synchronized()
                || keys.iter().any(|key| server.uploaded_keys.contains(key))
            {
                server.working_flag = true;
                candidates.push(server.server_guid);
            }
        }
        candidates
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.servers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synchronized(guid: u64, uploaded: &[CloudKey]) -> RemoteServer {
        let mut server = RemoteServer::new(PeerGuid::new(guid), PeerAddress::UNASSIGNED);
        server.sync_state = PeerSyncState::Synchronized;
        server.uploaded_keys = uploaded.iter().copied().collect();
        server
    }

    #[test]
    fn unsynchronized_peers_are_always_candidates() {
        let mut registry = ServerRegistry::new();
        registry.insert(RemoteServer::new(PeerGuid::new(1), PeerAddress::UNASSIGNED));

        let candidates = registry.fanout_candidates(&[CloudKey::new(9, 9)]);
        assert_eq!(candidates, vec![PeerGuid::new(1)]);
    }

    #[test]
    fn synchronized_peers_match_on_advertised_keys() {
        let mut registry = ServerRegistry::new();
        registry.insert(synchronized(1, &[CloudKey::new(1, 1)]));
        registry.insert(synchronized(2, &[CloudKey::new(2, 2)]));
        registry.insert(synchronized(3, &[]));

        let candidates = registry.fanout_candidates(&[CloudKey::new(2, 2), CloudKey::new(5, 5)]);
        assert_eq!(candidates, vec![PeerGuid::new(2)]);
    }

    #[test]
    fn candidates_are_not_duplicated_across_keys() {
        let mut registry = ServerRegistry::new();
        registry.insert(synchronized(1, &[CloudKey::new(1, 1), CloudKey::new(2, 2)]));

        let candidates = registry.fanout_candidates(&[CloudKey::new(1, 1), CloudKey::new(2, 2)]);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn double_insert_is_rejected() {
        let mut registry = ServerRegistry::new();
        assert!(registry.insert(RemoteServer::new(PeerGuid::new(1), PeerAddress::UNASSIGNED)));
        assert!(!registry.insert(RemoteServer::new(PeerGuid::new(1), PeerAddress::UNASSIGNED)));
        assert_eq!(registry.len(), 1);
    }
}
