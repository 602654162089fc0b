//! The local store of published payloads.
//!
//! Entries are kept alive by uploaders and subscribers only: a
//! `CloudDataList` with neither is removed, and a per-owner `CloudData`
//! without live payload survives only while specific subscribers name it.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use strato_core::{CloudKey, PeerAddress, PeerGuid};
use strato_proto::{CloudQueryRow, CloudQueryWithOrigins};

/// One owner's entry under a key.
#[derive(Debug, Clone)]
pub struct CloudData {
    /// Guid of the uploading client (the owner).
    pub owner_guid: PeerGuid,
    /// Address of the uploading client.
    pub owner_client_address: PeerAddress,
    /// Advertised address of the server holding the entry.
    pub owner_server_address: PeerAddress,
    /// Guid of the server holding the entry authoritatively.
    pub origin_server_guid: PeerGuid,
    /// The payload. Empty when `is_uploaded` is false.
    pub payload: Bytes,
    /// True if there is live payload; false for subscription placeholders.
    pub is_uploaded: bool,
    /// Local clients subscribed to this owner under this key.
    pub specific_subscribers: BTreeSet<PeerGuid>,
}

impl CloudData {
    /// Creates a subscription placeholder for an owner that has not
    /// uploaded anything yet.
    pub fn placeholder(owner_guid: PeerGuid, origin_server_guid: PeerGuid) -> Self {
        Self {
            owner_guid,
            owner_client_address: PeerAddress::UNASSIGNED,
            owner_server_address: PeerAddress::UNASSIGNED,
            origin_server_guid,
            payload: Bytes::new(),
            is_uploaded: false,
            specific_subscribers: BTreeSet::new(),
        }
    }

    /// Drops the payload, leaving a placeholder.
    pub fn clear_payload(&mut self) {
        self.payload = Bytes::new();
        self.is_uploaded = false;
    }

    /// True when nothing keeps this entry alive.
    pub fn is_unused(&self) -> bool {
        !self.is_uploaded && self.specific_subscribers.is_empty()
    }

    /// Renders this entry as a query row under `key`.
    pub fn to_row(&self, key: CloudKey) -> CloudQueryRow {
        CloudQueryRow {
            key,
            payload: self.payload.clone(),
            server_address: self.owner_server_address,
            client_address: self.owner_client_address,
            server_guid: self.origin_server_guid,
            client_guid: self.owner_guid,
        }
    }
}

/// All owners and subscribers of a single key.
#[derive(Debug, Clone)]
pub struct CloudDataList {
    /// The key.
    pub key: CloudKey,
    /// Per-owner entries, enumerated in owner-guid order.
    pub by_owner: BTreeMap<PeerGuid, CloudData>,
    /// Local clients subscribed to every owner of this key.
    pub non_specific_subscribers: BTreeSet<PeerGuid>,
    /// Owners with `is_uploaded` set.
    pub uploader_count: u32,
    /// Specific subscribers across owners plus non-specific subscribers.
    pub subscriber_count: u32,
}

impl CloudDataList {
    /// Creates an empty list for `key`.
    pub fn new(key: CloudKey) -> Self {
        Self {
            key,
            by_owner: BTreeMap::new(),
            non_specific_subscribers: BTreeSet::new(),
            uploader_count: 0,
            subscriber_count: 0,
        }
    }

    /// True when no uploader and no subscriber keeps the list alive.
    pub fn is_unused(&self) -> bool {
        self.uploader_count == 0 && self.subscriber_count == 0
    }
}

/// The keyed store of `CloudDataList` entries.
#[derive(Debug, Default)]
pub struct DataRepository {
    entries: BTreeMap<CloudKey, CloudDataList>,
}

impl DataRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the list for `key`, if present.
    pub fn get(&self, key: &CloudKey) -> Option<&CloudDataList> {
        self.entries.get(key)
    }

    /// Returns the list for `key` mutably, if present.
    pub fn get_mut(&mut self, key: &CloudKey) -> Option<&mut CloudDataList> {
        self.entries.get_mut(key)
    }

    /// Returns the list for `key`, inserting an empty one if absent.
    pub fn get_or_allocate(&mut self, key: CloudKey) -> &mut CloudDataList {
        self.entries
            .entry(key)
            .or_insert_with(|| CloudDataList::new(key))
    }

    /// Removes the list for `key`.
    pub fn remove(&mut self, key: &CloudKey) -> Option<CloudDataList> {
        self.entries.remove(key)
    }

    /// Removes the list for `key` if nothing keeps it alive.
    pub fn remove_if_unused(&mut self, key: &CloudKey) {
        if self.entries.get(key).is_some_and(|list| list.is_unused()) {
            self.entries.remove(key);
        }
    }

    /// Number of keyed lists.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the repository holds no lists.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates all lists in key order.
    pub fn iter(&self) -> impl Iterator<Item = &CloudDataList> {
        self.entries.values()
    }

    /// Keys with at least one uploader, in key order.
    pub fn uploaded_keys(&self) -> Vec<CloudKey> {
        self.entries
            .values()
            .filter(|list| list.uploader_count > 0)
            .map(|list| list.key)
            .collect()
    }

    /// Keys with at least one subscriber, in key order.
    pub fn subscribed_keys(&self) -> Vec<CloudKey> {
        self.entries
            .values()
            .filter(|list| list.subscriber_count > 0)
            .map(|list| list.key)
            .collect()
    }

    /// Runs a query against local data only.
    ///
    /// Keys are visited in query order and owners in owner-guid order; a
    /// key listed twice yields its rows twice. Only uploaded entries
    /// produce rows; pagination is the caller's concern because remote
    /// rows may still be merged in.
    pub fn query(&self, query: &CloudQueryWithOrigins) -> Vec<CloudQueryRow> {
        let mut rows = Vec::new();
        for key in &query.query.keys {
            let Some(list) = self.entries.get(key) else {
                continue;
            };
            if list.uploader_count == 0 {
                continue;
            }
            if query.specific_systems.is_empty() {
                for data in list.by_owner.values() {
                    if data.is_uploaded {
                        rows.push(data.to_row(*key));
                    }
                }
            } else {
                for owner in &query.specific_systems {
                    if let Some(data) = list.by_owner.get(owner) {
                        if data.is_uploaded {
                            rows.push(data.to_row(*key));
                        }
                    }
                }
            }
        }
        rows
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
