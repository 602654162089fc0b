//! Policy hooks invoked before every client operation.
//!
//! Filters see the request but not the node state, and cannot mutate
//! either. A `false` from any filter aborts the operation silently; the
//! filter itself may log or count out-of-band.

use std::sync::Arc;

use strato_core::{CloudKey, PeerAddress, PeerGuid};
use strato_proto::CloudQueryWithOrigins;

/// A policy hook on client operations.
///
/// Every method defaults to allowing the operation, so a filter only
/// overrides the operations it cares about. Authentication, rate limiting
/// and key-space partitioning all live behind this trait.
pub trait QueryFilter {
    /// Called before a payload is stored. `false` drops the post.
    fn on_post(
        &self,
        _client: PeerGuid,
        _client_address: PeerAddress,
        _key: CloudKey,
        _payload: &[u8],
    ) -> bool {
        true
    }

    /// Called before keys are released. `false` drops the release.
    fn on_release(
        &self,
        _client: PeerGuid,
        _client_address: PeerAddress,
        _keys: &[CloudKey],
    ) -> bool {
        true
    }

    /// Called before a query runs. `false` drops the query.
    fn on_get(
        &self,
        _client: PeerGuid,
        _client_address: PeerAddress,
        _query: &CloudQueryWithOrigins,
    ) -> bool {
        true
    }

    /// Called before subscriptions are cancelled. `false` drops the request.
    fn on_unsubscribe(
        &self,
        _client: PeerGuid,
        _client_address: PeerAddress,
        _keys: &[CloudKey],
        _specific_systems: &[PeerGuid],
    ) -> bool {
        true
    }
}

/// An ordered chain of query filters.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn QueryFilter>>,
}

impl FilterChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter. Adding the same filter instance twice is a no-op.
    pub fn add(&mut self, filter: Arc<dyn QueryFilter>) {
        if self.filters.iter().any(|f| Arc::ptr_eq(f, &filter)) {
            return;
        }
        self.filters.push(filter);
    }

    /// Removes a filter by identity.
    pub fn remove(&mut self, filter: &Arc<dyn QueryFilter>) {
        self.filters.retain(|f| !Arc::ptr_eq(f, filter));
    }

    /// Removes all filters.
    pub fn clear(&mut self) {
        self.filters.clear();
    }

    /// Number of installed filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True if no filters are installed.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the post hooks; any rejection short-circuits.
    pub fn allows_post(
        &self,
        client: PeerGuid,
        client_address: PeerAddress,
        key: CloudKey,
        payload: &[u8],
    ) -> bool {
        self.filters
            .iter()
            .all(|f| f.on_post(client, client_address, key, payload))
    }

    /// Runs the release hooks; any rejection short-circuits.
    pub fn allows_release(
        &self,
        client: PeerGuid,
        client_address: PeerAddress,
        keys: &[CloudKey],
    ) -> bool {
        self.filters
            .iter()
            .all(|f| f.on_release(client, client_address, keys))
    }

    /// Runs the get hooks; any rejection short-circuits.
    pub fn allows_get(
        &self,
        client: PeerGuid,
        client_address: PeerAddress,
        query: &CloudQueryWithOrigins,
    ) -> bool {
        self.filters
            .iter()
            .all(|f| f.on_get(client, client_address, query))
    }

    /// Runs the unsubscribe hooks; any rejection short-circuits.
    pub fn allows_unsubscribe(
        &self,
        client: PeerGuid,
        client_address: PeerAddress,
        keys: &[CloudKey],
        specific_systems: &[PeerGuid],
    ) -> bool {
        self.filters
            .iter()
            .all(|f| f.on_unsubscribe(client, client_address, keys, specific_systems))
    }
}
