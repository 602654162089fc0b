//! Per-connected-client bookkeeping.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use strato_core::{CloudKey, PeerGuid};

/// One client's subscription on a key.
///
/// An empty `specific_systems` set is a subscription to every owner of the
/// key; a non-empty set restricts change notifications to those owners.
#[derive(Debug, Clone, Default)]
pub struct KeySubscription {
    /// Owners subscribed to; empty means all.
    pub specific_systems: BTreeSet<PeerGuid>,
}

impl KeySubscription {
    /// A subscription to every owner of the key.
    pub fn to_all_owners() -> Self {
        Self::default()
    }

    /// A subscription restricted to the given owners.
    pub fn to_owners(owners: impl IntoIterator<Item = PeerGuid>) -> Self {
        Self {
            specific_systems: owners.into_iter().collect(),
        }
    }

    /// True if this subscription covers every owner.
    pub fn is_to_all_owners(&self) -> bool {
        self.specific_systems.is_empty()
    }
}

/// State kept for one connected client.
#[derive(Debug, Clone, Default)]
pub struct RemoteCloudClient {
    /// Keys this client has posted.
    pub uploaded_keys: BTreeSet<CloudKey>,
    /// Total payload bytes across this client's uploads.
    pub uploaded_bytes: u64,
    /// Keys this client subscribes to.
    pub subscriptions: BTreeMap<CloudKey, KeySubscription>,
}

impl RemoteCloudClient {
    /// True when nothing keeps this entry alive.
    pub fn is_unused(&self) -> bool {
        self.uploaded_keys.is_empty() && self.subscriptions.is_empty() && self.uploaded_bytes == 0
    }
}

/// Registry of connected clients, keyed by guid.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<PeerGuid, RemoteCloudClient>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client entry, if present.
    pub fn get(&self, guid: &PeerGuid) -> Option<&RemoteCloudClient> {
        self.clients.get(guid)
    }

    /// Returns the client entry mutably, if present.
    pub fn get_mut(&mut self, guid: &PeerGuid) -> Option<&mut RemoteCloudClient> {
        self.clients.get_mut(guid)
    }

    /// Returns the client entry, creating an empty one if absent.
    pub fn get_or_create(&mut self, guid: PeerGuid) -> &mut RemoteCloudClient {
        self.clients.entry(guid).or_default()
    }

    /// Removes and returns the client entry.
    pub fn remove(&mut self, guid: &PeerGuid) -> Option<RemoteCloudClient> {
        self.clients.remove(guid)
    }

    /// Removes the client entry if nothing keeps it alive.
    pub fn remove_if_unused(&mut self, guid: &PeerGuid) {
        if self.clients.get(guid).is_some_and(|c| c.is_unused()) {
            self.clients.remove(guid);
        }
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True if no clients are tracked.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Iterates all tracked clients.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerGuid, &RemoteCloudClient)> {
        self.clients.iter()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.clients.clear();
    }
}
