//! In-memory mesh harness.
//!
//! Nodes exchange envelopes synchronously: every mutation routes the
//! mesh to a fixed point before returning, so a test observes the state
//! after all fan-out has settled. Time is synthetic and only advances
//! through [`TestMesh::advance`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use strato_cloud::{CloudConfig, CloudNode, Envelope};
use strato_core::{PeerAddress, PeerGuid, Timestamp};
use strato_proto::{CloudMessage, CloudQuery, CloudQueryWithOrigins};
use tracing::trace;

/// An in-memory mesh of cloud nodes with attached clients.
pub struct TestMesh {
    nodes: BTreeMap<PeerGuid, CloudNode>,
    addresses: BTreeMap<PeerGuid, PeerAddress>,
    /// Which server each simulated client talks to.
    client_home: BTreeMap<PeerGuid, PeerGuid>,
    /// Messages delivered to each client, in arrival order.
    client_inboxes: BTreeMap<PeerGuid, Vec<CloudMessage>>,
    /// Directed links that silently drop envelopes.
    blocked_links: BTreeSet<(PeerGuid, PeerGuid)>,
    now: Timestamp,
    next_node: u64,
    next_client: u64,
}

impl TestMesh {
    /// Creates an empty mesh with default node configuration.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            addresses: BTreeMap::new(),
            client_home: BTreeMap::new(),
            client_inboxes: BTreeMap::new(),
            blocked_links: BTreeSet::new(),
            now: Timestamp::new(1_000_000),
            next_node: 0,
            next_client: 0,
        }
    }

    /// Creates a mesh of `count` nodes, fully connected.
    pub fn with_nodes(count: usize) -> Self {
        let mut mesh = Self::new();
        let guids: Vec<PeerGuid> = (0..count)
            .map(|_| mesh.add_node(CloudConfig::default()))
            .collect();
        for i in 0..guids.len() {
            for j in (i + 1)..guids.len() {
                mesh.connect_servers(guids[i], guids[j]);
            }
        }
        mesh
    }

    /// The synthetic current time.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Adds a node with the given configuration and returns its guid.
    pub fn add_node(&mut self, config: CloudConfig) -> PeerGuid {
        self.next_node += 1;
        let guid = PeerGuid::new(0xA000 + self.next_node);
        let address = PeerAddress::new(
            format!("10.1.0.{}:4242", self.next_node).parse().unwrap(),
        );
        self.nodes.insert(guid, CloudNode::new(guid, address, config));
        self.addresses.insert(guid, address);
        guid
    }

    /// Guids of all nodes, in creation order.
    pub fn node_guids(&self) -> Vec<PeerGuid> {
        self.nodes.keys().copied().collect()
    }

    /// Borrows a node for assertions.
    pub fn node(&self, guid: PeerGuid) -> &CloudNode {
        self.nodes.get(&guid).expect("unknown node")
    }

    /// Borrows a node mutably.
    pub fn node_mut(&mut self, guid: PeerGuid) -> &mut CloudNode {
        self.nodes.get_mut(&guid).expect("unknown node")
    }

    /// Connects two nodes as federated peers and settles the handshake.
    pub fn connect_servers(&mut self, a: PeerGuid, b: PeerGuid) {
        let addr_a = self.addresses[&a];
        let addr_b = self.addresses[&b];
        self.node_mut(a).add_server(b, addr_b);
        self.node_mut(b).add_server(a, addr_a);
        self.route();
    }

    /// Disconnects two nodes from each other and settles the fallout.
    pub fn disconnect_servers(&mut self, a: PeerGuid, b: PeerGuid) {
        self.node_mut(a).on_server_disconnect(b);
        self.node_mut(b).on_server_disconnect(a);
        self.route();
    }

    /// Silently drops all traffic from `from` to `to` until unblocked.
    pub fn block_link(&mut self, from: PeerGuid, to: PeerGuid) {
        self.blocked_links.insert((from, to));
    }

    /// Restores a previously blocked link.
    pub fn unblock_link(&mut self, from: PeerGuid, to: PeerGuid) {
        self.blocked_links.remove(&(from, to));
    }

    /// Attaches a new simulated client to `server` and returns its guid.
    pub fn add_client(&mut self, server: PeerGuid) -> PeerGuid {
        assert!(self.nodes.contains_key(&server), "unknown server");
        self.next_client += 1;
        let guid = PeerGuid::new(0xC000 + self.next_client);
        self.client_home.insert(guid, server);
        self.client_inboxes.insert(guid, Vec::new());
        guid
    }

    fn client_address(&self, client: PeerGuid) -> PeerAddress {
        PeerAddress::new(
            format!("10.2.0.{}:5151", client.value() & 0xFF)
                .parse()
                .unwrap(),
        )
    }

    /// Sends a message from a client to its home server and settles.
    pub fn client_send(&mut self, client: PeerGuid, message: CloudMessage) {
        let home = *self.client_home.get(&client).expect("unknown client");
        let address = self.client_address(client);
        let now = self.now;
        self.node_mut(home).handle_message(client, address, message, now);
        self.route();
    }

    /// Posts a payload from a client.
    pub fn post(&mut self, client: PeerGuid, key: strato_core::CloudKey, payload: &[u8]) {
        self.client_send(
            client,
            CloudMessage::Post {
                key,
                payload: bytes::Bytes::copy_from_slice(payload),
            },
        );
    }

    /// Issues a plain get for one key from a client.
    pub fn get(&mut self, client: PeerGuid, key: strato_core::CloudKey) {
        self.client_send(
            client,
            CloudMessage::Get {
                query: CloudQueryWithOrigins {
                    query: CloudQuery::for_key(key),
                    specific_systems: vec![],
                },
            },
        );
    }

    /// Subscribes a client to a key, optionally scoped to owners.
    pub fn subscribe(
        &mut self,
        client: PeerGuid,
        key: strato_core::CloudKey,
        specific_systems: Vec<PeerGuid>,
    ) {
        self.client_send(
            client,
            CloudMessage::Get {
                query: CloudQueryWithOrigins {
                    query: CloudQuery {
                        keys: vec![key],
                        subscribe_to_results: true,
                        ..Default::default()
                    },
                    specific_systems,
                },
            },
        );
    }

    /// Disconnects a client from its home server and settles.
    pub fn disconnect_client(&mut self, client: PeerGuid) {
        let home = *self.client_home.get(&client).expect("unknown client");
        self.node_mut(home).on_client_disconnect(client);
        self.client_home.remove(&client);
        self.route();
    }

    /// Drains and returns everything delivered to a client so far.
    pub fn client_inbox(&mut self, client: PeerGuid) -> Vec<CloudMessage> {
        std::mem::take(
            self.client_inboxes
                .get_mut(&client)
                .expect("unknown client"),
        )
    }

    /// Advances the synthetic clock, ticking every node, and settles.
    pub fn advance(&mut self, ms: u64) {
        self.now = self.now.add(Duration::from_millis(ms));
        let now = self.now;
        for node in self.nodes.values_mut() {
            node.tick(now);
        }
        self.route();
    }

    /// Asserts the bookkeeping of every node.
    pub fn check_all(&self) {
        for node in self.nodes.values() {
            node.check_consistency();
        }
    }

    /// Routes envelopes until no node has outbound traffic.
    fn route(&mut self) {
        let mut pending: VecDeque<(PeerGuid, Envelope)> = VecDeque::new();
        loop {
            for (guid, node) in self.nodes.iter_mut() {
                for envelope in node.take_outbound() {
                    pending.push_back((*guid, envelope));
                }
            }
            let Some((from, envelope)) = pending.pop_front() else {
                return;
            };

            if self.blocked_links.contains(&(from, envelope.to)) {
                trace!(%from, to = %envelope.to, "dropping envelope on blocked link");
                continue;
            }

            if let Some(inbox) = self.client_inboxes.get_mut(&envelope.to) {
                inbox.push(envelope.message);
                continue;
            }

            if self.nodes.contains_key(&envelope.to) {
                let from_address = self.addresses[&from];
                let now = self.now;
                self.node_mut(envelope.to)
                    .handle_message(from, from_address, envelope.message, now);
                continue;
            }

            // Destination disconnected since the envelope was queued.
            trace!(to = %envelope.to, "dropping envelope to unknown destination");
        }
    }
}

impl Default for TestMesh {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_core::CloudKey;

    #[test]
    fn mesh_construction_connects_peers() {
        let mesh = TestMesh::with_nodes(3);
        for guid in mesh.node_guids() {
            assert_eq!(mesh.node(guid).remote_servers().len(), 2);
        }
        mesh.check_all();
    }

    #[test]
    fn client_roundtrip_through_harness() {
        let mut mesh = TestMesh::with_nodes(1);
        let server = mesh.node_guids()[0];
        let client = mesh.add_client(server);

        mesh.post(client, CloudKey::new(1, 1), b"x");
        mesh.get(client, CloudKey::new(1, 1));

        let inbox = mesh.client_inbox(client);
        assert_eq!(inbox.len(), 1);
        assert!(matches!(inbox[0], CloudMessage::GetResponse { .. }));
        mesh.check_all();
    }
}
