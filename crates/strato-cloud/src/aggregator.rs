//! In-flight aggregated get requests.
//!
//! A request is registered only while at least one remote response is
//! outstanding; a locally-answerable query never enters the table. The
//! table is swept periodically so a silent peer cannot hold a request
//! open past its timeout.

use std::collections::BTreeMap;

use strato_core::{PeerGuid, Timestamp};
use strato_proto::{CloudQueryRow, CloudQueryWithOrigins};

/// One peer's slot in an aggregated request.
#[derive(Debug, Clone, Default)]
pub struct PeerResponse {
    /// Whether the peer has answered.
    pub got_result: bool,
    /// The rows it answered with.
    pub rows: Vec<CloudQueryRow>,
}

/// An aggregated get request awaiting remote rows.
#[derive(Debug, Clone)]
pub struct GetRequest {
    /// Process-unique monotone id.
    pub request_id: u32,
    /// The client the merged response goes back to.
    pub requesting_client: PeerGuid,
    /// The query being aggregated.
    pub query: CloudQueryWithOrigins,
    /// One slot per consulted peer.
    pub remote_responses: BTreeMap<PeerGuid, PeerResponse>,
    /// When the request was registered.
    pub started_at: Timestamp,
}

impl GetRequest {
    /// Creates a request with one empty slot per candidate peer.
    pub fn new(
        request_id: u32,
        requesting_client: PeerGuid,
        query: CloudQueryWithOrigins,
        candidates: &[PeerGuid],
        started_at: Timestamp,
    ) -> Self {
        Self {
            request_id,
            requesting_client,
            query,
            remote_responses: candidates
                .iter()
                .map(|guid| (*guid, PeerResponse::default()))
                .collect(),
            started_at,
        }
    }

    /// True when every remaining slot has a result.
    pub fn all_responded(&self) -> bool {
        self.remote_responses.values().all(|r| r.got_result)
    }
}

/// The table of in-flight aggregated requests.
#[derive(Debug, Default)]
pub struct GetAggregator {
    requests: BTreeMap<u32, GetRequest>,
    next_request_id: u32,
}

impl GetAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request id.
    pub fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Registers an in-flight request.
    pub fn register(&mut self, request: GetRequest) {
        debug_assert!(!request.remote_responses.is_empty());
        self.requests.insert(request.request_id, request);
    }

    /// Records a peer's answer.
    ///
    /// Returns the completed request once every slot has a result.
    /// Unknown ids, unknown peers, and duplicate answers are ignored: the
    /// request may have timed out, or the peer may answer twice across a
    /// reconnect.
    pub fn record_response(
        &mut self,
        request_id: u32,
        from: PeerGuid,
        rows: Vec<CloudQueryRow>,
    ) -> Option<GetRequest> {
        let request = self.requests.get_mut(&request_id)?;
        let slot = request.remote_responses.get_mut(&from)?;
        if slot.got_result {
            return None;
        }
        slot.got_result = true;
        slot.rows = rows;

        if request.all_responded() {
            return self.requests.remove(&request_id);
        }
        None
    }

    /// Drops a disconnected peer's slots.
    ///
    /// Returns every request that became fully answered (or ran out of
    /// peers entirely) once the slots were removed.
    pub fn remove_peer(&mut self, guid: &PeerGuid) -> Vec<GetRequest> {
        let mut completed = Vec::new();
        let ids: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, r)| r.remote_responses.contains_key(guid))
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let request = self.requests.get_mut(&id).expect("id collected above");
            request.remote_responses.remove(guid);
            if request.all_responded() {
                completed.push(self.requests.remove(&id).expect("id collected above"));
            }
        }
        completed
    }

    /// Removes and returns every request older than `timeout_ms`.
    pub fn take_expired(&mut self, now: Timestamp, timeout_ms: u64) -> Vec<GetRequest> {
        let ids: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, r)| now.millis_since(r.started_at) > timeout_ms)
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True if no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Iterates in-flight requests in id order.
    pub fn iter(&self) -> impl Iterator<Item = &GetRequest> {
        self.requests.values()
    }

    /// Drops everything in flight.
    pub fn clear(&mut self) {
        self.requests.clear();
    }
}
