//! The owning handle of the cloud subsystem.
//!
//! A `CloudNode` holds the repository, both registries, the aggregator and
//! the filter chain, and turns inbound messages into state changes plus
//! outbound envelopes. The transport is an external collaborator: it feeds
//! packets in, drains the outbox, and reports connects and disconnects.
//!
//! Nothing here blocks or suspends. Handlers take the current time as a
//! parameter where it matters, so the tick loop owns the clock and tests
//! can drive timeouts synchronously.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use strato_core::{CloudKey, PeerAddress, PeerGuid, Timestamp, WireDecode};
use strato_proto::{
    CloudMessage, CloudQuery, CloudQueryResult, CloudQueryRow, CloudQueryWithOrigins,
    ServerCommand,
};
use tracing::{debug, info, warn};

use crate::aggregator::{GetAggregator, GetRequest};
use crate::clients::{ClientRegistry, KeySubscription};
use crate::config::CloudConfig;
use crate::filter::{FilterChain, QueryFilter};
use crate::repository::{CloudData, DataRepository};
use crate::servers::{PeerSyncState, RemoteServer, ServerRegistry};

/// An outbound message and its destination.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Guid of the receiving peer (client or server).
    pub to: PeerGuid,
    /// The message to deliver.
    pub message: CloudMessage,
}

/// Counts of live state, for logging and status output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudStats {
    /// Keys with at least one uploader or subscriber.
    pub keys: usize,
    /// Tracked clients.
    pub clients: usize,
    /// Federated peers.
    pub servers: usize,
    /// In-flight aggregated requests.
    pub outstanding_requests: usize,
}

/// A cloud store node participating in the mesh.
pub struct CloudNode {
    config: CloudConfig,
    local_guid: PeerGuid,
    local_address: PeerAddress,
    repository: DataRepository,
    clients: ClientRegistry,
    servers: ServerRegistry,
    aggregator: GetAggregator,
    filters: FilterChain,
    outbox: VecDeque<Envelope>,
    next_sweep_at: Timestamp,
}

impl CloudNode {
    /// Creates a node with the given identity and configuration.
    pub fn new(local_guid: PeerGuid, local_address: PeerAddress, config: CloudConfig) -> Self {
        Self {
            config,
            local_guid,
            local_address,
            repository: DataRepository::new(),
            clients: ClientRegistry::new(),
            servers: ServerRegistry::new(),
            aggregator: GetAggregator::new(),
            filters: FilterChain::new(),
            outbox: VecDeque::new(),
            next_sweep_at: Timestamp::new(0),
        }
    }

    /// This node's guid.
    pub fn local_guid(&self) -> PeerGuid {
        self.local_guid
    }

    /// Counts of live state.
    pub fn stats(&self) -> CloudStats {
        CloudStats {
            keys: self.repository.len(),
            clients: self.clients.len(),
            servers: self.servers.len(),
            outstanding_requests: self.aggregator.len(),
        }
    }

    /// Appends a query filter. Adding the same instance twice is a no-op.
    pub fn add_filter(&mut self, filter: Arc<dyn QueryFilter>) {
        self.filters.add(filter);
    }

    /// Removes a query filter by identity.
    pub fn remove_filter(&mut self, filter: &Arc<dyn QueryFilter>) {
        self.filters.remove(filter);
    }

    /// Removes all query filters.
    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    /// Guids of the federated peers currently registered.
    pub fn remote_servers(&self) -> Vec<PeerGuid> {
        self.servers.guids()
    }

    /// Removes the next outbound envelope, if any.
    pub fn poll_outbound(&mut self) -> Option<Envelope> {
        self.outbox.pop_front()
    }

    /// Removes and returns all outbound envelopes.
    pub fn take_outbound(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    /// True if envelopes are waiting for the transport.
    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Registers a federated peer and sends it our key-set snapshot.
    ///
    /// The snapshot is sent even when both sets are empty so the peer
    /// reaches its synchronized state on an idle mesh.
    pub fn add_server(&mut self, guid: PeerGuid, address: PeerAddress) {
        if !self.servers.insert(RemoteServer::new(guid, address)) {
            return;
        }

        let uploaded = self.repository.uploaded_keys();
        let subscribed = self.repository.subscribed_keys();
        info!(peer = %guid, uploaded = uploaded.len(), subscribed = subscribed.len(),
              "federated peer added, sending key-set snapshot");
        self.send_to(
            guid,
            CloudMessage::ServerToServer {
                command: ServerCommand::UploadedAndSubscribedKeys {
                    uploaded,
                    subscribed,
                },
            },
        );
    }

    /// Handles a federated peer disconnecting.
    ///
    /// The peer's aggregator slots are dropped, completing any request
    /// that now has all remaining answers, and its registry entry is
    /// destroyed.
    pub fn on_server_disconnect(&mut self, guid: PeerGuid) {
        if self.servers.remove(&guid).is_none() {
            return;
        }
        info!(peer = %guid, "federated peer removed");

        let completed = self.aggregator.remove_peer(&guid);
        for request in completed {
            self.finish_get_request(request);
        }
    }

    /// Handles a client disconnecting.
    ///
    /// Walks the release path for everything the client uploaded and the
    /// unsubscribe path for everything it subscribed to, then destroys
    /// its registry entry.
    pub fn on_client_disconnect(&mut self, guid: PeerGuid) {
        let Some(client) = self.clients.get(&guid) else {
            return;
        };
        let uploaded: Vec<CloudKey> = client.uploaded_keys.iter().copied().collect();
        let subscribed: Vec<CloudKey> = client.subscriptions.keys().copied().collect();
        debug!(client = %guid, uploaded = uploaded.len(), subscribed = subscribed.len(),
               "client disconnected, releasing state");

        self.release_keys(guid, &uploaded);
        for key in subscribed {
            self.unsubscribe_client(guid, key, &[]);
        }
        self.clients.remove(&guid);
    }

    /// Decodes and handles one inbound packet.
    ///
    /// Malformed packets are dropped without disconnecting the sender.
    pub fn handle_packet(
        &mut self,
        from: PeerGuid,
        from_address: PeerAddress,
        packet: &[u8],
        now: Timestamp,
    ) {
        match CloudMessage::from_bytes(packet) {
            Ok(message) => self.handle_message(from, from_address, message, now),
            Err(err) => warn!(peer = %from, %err, "dropping malformed packet"),
        }
    }

    /// Handles one inbound message.
    pub fn handle_message(
        &mut self,
        from: PeerGuid,
        from_address: PeerAddress,
        message: CloudMessage,
        now: Timestamp,
    ) {
        match message {
            CloudMessage::Post { key, payload } => self.on_post(from, from_address, key, payload),
            CloudMessage::Release { keys } => self.on_release(from, from_address, &keys),
            CloudMessage::Get { query } => self.on_get(from, from_address, query, now),
            CloudMessage::Unsubscribe {
                keys,
                specific_systems,
            } => self.on_unsubscribe(from, from_address, &keys, &specific_systems),
            CloudMessage::ServerToServer { command } => self.on_server_command(from, command),
            CloudMessage::GetResponse { .. } | CloudMessage::SubscriptionNotification { .. } => {
                debug!(peer = %from, "ignoring client-bound message");
            }
        }
    }

    /// Runs the periodic sweep.
    ///
    /// Aggregated requests older than the configured timeout complete
    /// with whatever rows have arrived. Call on the transport's cadence;
    /// sweeps are internally rate-limited to the configured interval.
    pub fn tick(&mut self, now: Timestamp) {
        if now < self.next_sweep_at {
            return;
        }
        self.next_sweep_at = now.add(Duration::from_millis(self.config.get_sweep_interval_ms));

        let expired = self
            .aggregator
            .take_expired(now, self.config.get_request_timeout_ms);
        for request in expired {
            debug!(request_id = request.request_id, client = %request.requesting_client,
                   "aggregated request timed out, answering with partial rows");
            self.finish_get_request(request);
        }
    }

    /// Drops all repository, registry and aggregator state.
    pub fn clear(&mut self) {
        self.repository.clear();
        self.clients.clear();
        self.servers.clear();
        self.aggregator.clear();
        self.outbox.clear();
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    fn on_post(&mut self, from: PeerGuid, from_address: PeerAddress, key: CloudKey, payload: Bytes) {
        let new_len = payload.len() as u64;
        let quota = self.config.max_upload_bytes_per_client;
        if quota > 0 && new_len > quota {
            debug!(client = %from, key = %key, bytes = new_len, "post exceeds upload quota");
            return;
        }
        if !self.filters.allows_post(from, from_address, key, &payload) {
            return;
        }

        // Bytes an overwrite would return to the client's budget.
        let existing_len = self
            .repository
            .get(&key)
            .and_then(|list| list.by_owner.get(&from))
            .filter(|data| data.is_uploaded)
            .map(|data| data.payload.len() as u64)
            .unwrap_or(0);

        {
            let client = self.clients.get_or_create(from);
            if quota > 0 && client.uploaded_bytes - existing_len + new_len > quota {
                debug!(client = %from, key = %key, held = client.uploaded_bytes, bytes = new_len,
                       "post rejected, client over upload quota");
                self.clients.remove_if_unused(&from);
                return;
            }
            client.uploaded_keys.insert(key);
            client.uploaded_bytes = client.uploaded_bytes - existing_len + new_len;
        }

        let server_address = self
            .config
            .force_external_address
            .unwrap_or(self.local_address);
        let local_guid = self.local_guid;

        let (row, specific, non_specific, first_uploader) = {
            let list = self.repository.get_or_allocate(key);
            let had_uploads = list.uploader_count > 0;
            let data = list
                .by_owner
                .entry(from)
                .or_insert_with(|| CloudData::placeholder(from, local_guid));

            let fresh_upload = !data.is_uploaded;
            data.is_uploaded = true;
            data.payload = payload;
            data.owner_client_address = from_address;
            data.owner_server_address = server_address;
            data.origin_server_guid = local_guid;
            if fresh_upload {
                list.uploader_count += 1;
            }

            let row = data.to_row(key);
            let specific: Vec<PeerGuid> = data.specific_subscribers.iter().copied().collect();
            let non_specific: Vec<PeerGuid> =
                list.non_specific_subscribers.iter().copied().collect();
            (row, specific, non_specific, fresh_upload && !had_uploads)
        };

        debug!(client = %from, key = %key, bytes = new_len, "payload stored");

        if first_uploader {
            self.broadcast(ServerCommand::AddUploadedKey { key });
        }
        self.notify_client_subscribers(&row, &specific, true);
        self.notify_client_subscribers(&row, &non_specific, true);
        self.notify_server_subscribers(&row, key, true);
    }

    fn on_release(&mut self, from: PeerGuid, from_address: PeerAddress, keys: &[CloudKey]) {
        if keys.is_empty() || self.clients.get(&from).is_none() {
            return;
        }
        if !self.filters.allows_release(from, from_address, keys) {
            return;
        }
        self.release_keys(from, keys);
        self.clients.remove_if_unused(&from);
    }

    /// The release path shared by `Release` handling and client disconnect.
    fn release_keys(&mut self, from: PeerGuid, keys: &[CloudKey]) {
        for &key in keys {
            let released = {
                let Some(client) = self.clients.get_mut(&from) else {
                    return;
                };
                if !client.uploaded_keys.remove(&key) {
                    continue;
                }

                let Some(list) = self.repository.get_mut(&key) else {
                    continue;
                };
                let Some(data) = list.by_owner.get_mut(&from) else {
                    continue;
                };
                if !data.is_uploaded {
                    continue;
                }

                let released = data.payload.len() as u64;
                let row = data.to_row(key);
                let specific: Vec<PeerGuid> = data.specific_subscribers.iter().copied().collect();
                let non_specific: Vec<PeerGuid> =
                    list.non_specific_subscribers.iter().copied().collect();

                data.clear_payload();
                list.uploader_count -= 1;
                if data.is_unused() {
                    list.by_owner.remove(&from);
                }
                let no_uploads_left = list.uploader_count == 0;

                client.uploaded_bytes -= released;

                Some((row, specific, non_specific, no_uploads_left))
            };

            let Some((row, specific, non_specific, no_uploads_left)) = released else {
                continue;
            };

            debug!(client = %from, key = %key, "payload released");
            self.notify_client_subscribers(&row, &specific, false);
            self.notify_client_subscribers(&row, &non_specific, false);
            self.notify_server_subscribers(&row, key, false);

            if no_uploads_left {
                self.broadcast(ServerCommand::RemoveUploadedKey { key });
            }
            self.repository.remove_if_unused(&key);
        }
    }

    fn on_get(
        &mut self,
        from: PeerGuid,
        from_address: PeerAddress,
        query: CloudQueryWithOrigins,
        now: Timestamp,
    ) {
        if query.query.keys.is_empty() {
            return;
        }
        if !self.filters.allows_get(from, from_address, &query) {
            return;
        }

        let candidates = self.servers.fanout_candidates(&query.query.keys);

        if query.query.subscribe_to_results {
            self.install_subscriptions(from, &query);
        }

        if candidates.is_empty() {
            let rows = self.repository.query(&query);
            self.respond_with_rows(from, &query.query, rows);
            return;
        }

        let request_id = self.aggregator.next_request_id();
        debug!(client = %from, request_id, peers = candidates.len(),
               "fanning get request out to peers");
        self.aggregator.register(GetRequest::new(
            request_id,
            from,
            query.clone(),
            &candidates,
            now,
        ));
        for peer in candidates {
            self.send_to(
                peer,
                CloudMessage::ServerToServer {
                    command: ServerCommand::ProcessGetRequest {
                        query: query.clone(),
                        request_id,
                    },
                },
            );
        }
    }

    fn on_unsubscribe(
        &mut self,
        from: PeerGuid,
        from_address: PeerAddress,
        keys: &[CloudKey],
        specific_systems: &[PeerGuid],
    ) {
        if self.clients.get(&from).is_none() {
            return;
        }
        if !self
            .filters
            .allows_unsubscribe(from, from_address, keys, specific_systems)
        {
            return;
        }

        for &key in keys {
            if self.repository.get(&key).is_none() {
                continue;
            }
            self.unsubscribe_client(from, key, specific_systems);
        }
        self.clients.remove_if_unused(&from);
    }

    // ------------------------------------------------------------------
    // Subscription bookkeeping
    // ------------------------------------------------------------------

    /// Installs the subscriptions a get with `subscribe_to_results` asked
    /// for, one per queried key.
    fn install_subscriptions(&mut self, from: PeerGuid, query: &CloudQueryWithOrigins) {
        let local_guid = self.local_guid;

        for &key in &query.query.keys {
            // Re-subscribing replaces the previous subscription on the key.
            let had_subscription = self
                .clients
                .get(&from)
                .is_some_and(|c| c.subscriptions.contains_key(&key));
            if had_subscription {
                self.unsubscribe_client(from, key, &[]);
            }

            self.clients.get_or_create(from).subscriptions.insert(
                key,
                KeySubscription::to_owners(query.specific_systems.iter().copied()),
            );

            let first_subscriber = {
                let list = self.repository.get_or_allocate(key);
                let first_subscriber = list.subscriber_count == 0;

                if query.specific_systems.is_empty() {
                    if list.non_specific_subscribers.insert(from) {
                        list.subscriber_count += 1;
                    }

                    // A subscription to all owners supersedes any specific
                    // ones this client held under the key. Collect the
                    // owners first, then modify.
                    let owners: Vec<PeerGuid> = list
                        .by_owner
                        .iter()
                        .filter(|(_, data)| data.specific_subscribers.contains(&from))
                        .map(|(owner, _)| *owner)
                        .collect();
                    for owner in owners {
                        let unused = {
                            let data = list.by_owner.get_mut(&owner).expect("owner collected above");
                            data.specific_subscribers.remove(&from);
                            data.is_unused()
                        };
                        list.subscriber_count -= 1;
                        if unused {
                            list.by_owner.remove(&owner);
                        }
                    }
                } else {
                    for &owner in &query.specific_systems {
                        let data = list
                            .by_owner
                            .entry(owner)
                            .or_insert_with(|| CloudData::placeholder(owner, local_guid));
                        if data.specific_subscribers.insert(from) {
                            list.subscriber_count += 1;
                        }
                    }
                }
                first_subscriber
            };

            if first_subscriber {
                self.broadcast(ServerCommand::AddSubscribedKey { key });
            }
        }

        self.clients.remove_if_unused(&from);
    }

    /// Cancels a client's subscription on `key`.
    ///
    /// An empty `specific_systems` cancels the whole subscription,
    /// whatever its scope; a non-empty list narrows a specific
    /// subscription by those owners and is a no-op against a
    /// subscription to all owners.
    fn unsubscribe_client(&mut self, from: PeerGuid, key: CloudKey, specific_systems: &[PeerGuid]) {
        let scope = {
            let Some(client) = self.clients.get(&from) else {
                return;
            };
            let Some(subscription) = client.subscriptions.get(&key) else {
                return;
            };
            if subscription.is_to_all_owners() && !specific_systems.is_empty() {
                return;
            }
            subscription.clone()
        };
        if self.repository.get(&key).is_none() {
            return;
        }

        if specific_systems.is_empty() {
            let removed_global = {
                let list = self.repository.get_mut(&key).expect("checked above");
                if list.non_specific_subscribers.remove(&from) {
                    list.subscriber_count -= 1;
                    true
                } else {
                    false
                }
            };
            if !removed_global {
                for owner in &scope.specific_systems {
                    self.remove_specific_subscriber(key, *owner, from);
                }
            }
            if let Some(client) = self.clients.get_mut(&from) {
                client.subscriptions.remove(&key);
            }
        } else {
            let mut removed_owners = Vec::new();
            if let Some(client) = self.clients.get_mut(&from) {
                if let Some(subscription) = client.subscriptions.get_mut(&key) {
                    for owner in specific_systems {
                        if subscription.specific_systems.remove(owner) {
                            removed_owners.push(*owner);
                        }
                    }
                    if subscription.specific_systems.is_empty() {
                        client.subscriptions.remove(&key);
                    }
                }
            }
            for owner in removed_owners {
                self.remove_specific_subscriber(key, owner, from);
            }
        }

        let no_subscribers = self
            .repository
            .get(&key)
            .is_some_and(|list| list.subscriber_count == 0);
        if no_subscribers {
            self.broadcast(ServerCommand::RemoveSubscribedKey { key });
        }
        self.repository.remove_if_unused(&key);
    }

    /// Removes `subscriber` from one owner's specific-subscriber set.
    fn remove_specific_subscriber(&mut self, key: CloudKey, owner: PeerGuid, subscriber: PeerGuid) {
        let Some(list) = self.repository.get_mut(&key) else {
            return;
        };
        let Some(data) = list.by_owner.get_mut(&owner) else {
            return;
        };
        if !data.specific_subscribers.remove(&subscriber) {
            return;
        }
        list.subscriber_count -= 1;
        if data.is_unused() {
            list.by_owner.remove(&owner);
        }
    }

    // ------------------------------------------------------------------
    // Server-to-server operations
    // ------------------------------------------------------------------

    fn on_server_command(&mut self, from: PeerGuid, command: ServerCommand) {
        // The peer may have disconnected between the transport check and
        // this handler; drop silently.
        if !self.servers.contains(&from) {
            debug!(peer = %from, "dropping command from unknown peer");
            return;
        }

        match command {
            ServerCommand::ProcessGetRequest { query, request_id } => {
                let rows = self.repository.query(&query);
                self.send_to(
                    from,
                    CloudMessage::ServerToServer {
                        command: ServerCommand::ProcessGetResponse { request_id, rows },
                    },
                );
            }
            ServerCommand::ProcessGetResponse { request_id, rows } => {
                if let Some(request) = self.aggregator.record_response(request_id, from, rows) {
                    self.finish_get_request(request);
                }
            }
            ServerCommand::UploadedAndSubscribedKeys {
                uploaded,
                subscribed,
            } => {
                let server = self.servers.get_mut(&from).expect("membership checked");
                server.sync_state = PeerSyncState::Synchronized;
                server.uploaded_keys.extend(uploaded);
                server.subscribed_keys.extend(subscribed);
                debug!(peer = %from, uploaded = server.uploaded_keys.len(),
                       subscribed = server.subscribed_keys.len(), "peer key-set snapshot applied");
            }
            ServerCommand::AddUploadedKey { key } => {
                let server = self.servers.get_mut(&from).expect("membership checked");
                server.uploaded_keys.insert(key);
            }
            ServerCommand::AddSubscribedKey { key } => {
                let server = self.servers.get_mut(&from).expect("membership checked");
                server.subscribed_keys.insert(key);
            }
            ServerCommand::RemoveUploadedKey { key } => {
                let server = self.servers.get_mut(&from).expect("membership checked");
                server.uploaded_keys.remove(&key);
            }
            ServerCommand::RemoveSubscribedKey { key } => {
                let server = self.servers.get_mut(&from).expect("membership checked");
                server.subscribed_keys.remove(&key);
            }
            ServerCommand::DataChanged { was_updated, row } => {
                self.on_remote_data_changed(was_updated, row);
            }
        }
    }

    /// Relays a remote change to local subscribers; no further server
    /// fan-out happens here.
    fn on_remote_data_changed(&mut self, was_updated: bool, row: CloudQueryRow) {
        let Some(list) = self.repository.get(&row.key) else {
            return;
        };

        let mut targets: Vec<PeerGuid> = Vec::new();
        if let Some(data) = list.by_owner.get(&row.client_guid) {
            targets.extend(data.specific_subscribers.iter().copied());
        }
        targets.extend(list.non_specific_subscribers.iter().copied());

        self.notify_client_subscribers(&row, &targets, was_updated);
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    /// Merges local rows with whatever remote rows arrived and answers
    /// the requesting client.
    fn finish_get_request(&mut self, request: GetRequest) {
        let mut rows = self.repository.query(&request.query);
        for response in request.remote_responses.values() {
            rows.extend(response.rows.iter().cloned());
        }
        self.respond_with_rows(request.requesting_client, &request.query.query, rows);
    }

    /// Paginates merged rows and sends the get response.
    fn respond_with_rows(&mut self, client: PeerGuid, query: &CloudQuery, rows: Vec<CloudQueryRow>) {
        let rows = self.paginate(query, rows);
        self.send_to(
            client,
            CloudMessage::GetResponse {
                result: CloudQueryResult {
                    query: query.clone(),
                    rows,
                },
            },
        );
    }

    /// Applies `starting_row`, `max_rows` and the download byte cap
    /// across the merged row sequence.
    fn paginate(&self, query: &CloudQuery, rows: Vec<CloudQueryRow>) -> Vec<CloudQueryRow> {
        let skip = query.starting_row as usize;
        let take = if query.max_rows == 0 {
            usize::MAX
        } else {
            query.max_rows as usize
        };
        let byte_cap = self.config.max_bytes_per_download;

        let mut out = Vec::new();
        let mut payload_bytes = 0u64;
        for row in rows.into_iter().skip(skip).take(take) {
            payload_bytes += row.payload.len() as u64;
            if byte_cap > 0 && payload_bytes > byte_cap {
                break;
            }
            out.push(row);
        }
        out
    }

    // ------------------------------------------------------------------
    // Notification fan-out
    // ------------------------------------------------------------------

    fn notify_client_subscribers(
        &mut self,
        row: &CloudQueryRow,
        subscribers: &[PeerGuid],
        was_updated: bool,
    ) {
        for &subscriber in subscribers {
            self.send_to(
                subscriber,
                CloudMessage::SubscriptionNotification {
                    was_updated,
                    row: row.clone(),
                },
            );
        }
    }

    /// Sends a `DataChanged` to every peer that either has not completed
    /// its handshake or subscribes to the key.
    fn notify_server_subscribers(&mut self, row: &CloudQueryRow, key: CloudKey, was_updated: bool) {
        let targets: Vec<PeerGuid> = self
            .servers
            .iter()
            .filter(|s| !s.is_synchronized() || s.subscribed_keys.contains(&key))
            .map(|s| s.server_guid)
            .collect();

        for peer in targets {
            self.send_to(
                peer,
                CloudMessage::ServerToServer {
                    command: ServerCommand::DataChanged {
                        was_updated,
                        row: row.clone(),
                    },
                },
            );
        }
    }

    /// Sends a command to every registered peer.
    fn broadcast(&mut self, command: ServerCommand) {
        let peers = self.servers.guids();
        for peer in peers {
            self.send_to(
                peer,
                CloudMessage::ServerToServer {
                    command: command.clone(),
                },
            );
        }
    }

    fn send_to(&mut self, to: PeerGuid, message: CloudMessage) {
        self.outbox.push_back(Envelope { to, message });
    }

    // ------------------------------------------------------------------
    // Consistency checking
    // ------------------------------------------------------------------

    /// Asserts that the internal bookkeeping is self-consistent.
    ///
    /// Test and debugging support; panics with a description of the first
    /// violation found.
    pub fn check_consistency(&self) {
        for list in self.repository.iter() {
            let specific_total: usize = list
                .by_owner
                .values()
                .map(|d| d.specific_subscribers.len())
                .sum();
            assert_eq!(
                list.subscriber_count as usize,
                list.non_specific_subscribers.len() + specific_total,
                "subscriber count drifted for key {}",
                list.key
            );
            let uploads = list.by_owner.values().filter(|d| d.is_uploaded).count();
            assert_eq!(
                list.uploader_count as usize, uploads,
                "uploader count drifted for key {}",
                list.key
            );
            assert!(
                !list.is_unused(),
                "unused list retained for key {}",
                list.key
            );
            for data in list.by_owner.values() {
                assert!(
                    data.is_uploaded || data.payload.is_empty(),
                    "placeholder holds payload for key {}",
                    list.key
                );
                assert!(
                    !data.is_unused(),
                    "unused entry retained for key {} owner {}",
                    list.key,
                    data.owner_guid
                );
            }
        }

        for (guid, client) in self.clients.iter() {
            assert!(!client.is_unused(), "unused client retained: {guid}");
            let held: u64 = client
                .uploaded_keys
                .iter()
                .filter_map(|key| self.repository.get(key))
                .filter_map(|list| list.by_owner.get(guid))
                .filter(|data| data.is_uploaded)
                .map(|data| data.payload.len() as u64)
                .sum();
            assert_eq!(
                client.uploaded_bytes, held,
                "uploaded byte account drifted for client {guid}"
            );
        }

        for request in self.aggregator.iter() {
            assert!(
                !request.remote_responses.is_empty(),
                "request {} retained without response slots",
                request.request_id
            );
            assert!(
                !request.all_responded(),
                "fully answered request {} retained",
                request.request_id
            );
        }
    }
}
