//! Single-node store behavior driven through the wire messages.

use bytes::Bytes;
use strato_cloud::CloudConfig;
use strato_core::CloudKey;
use strato_proto::{CloudMessage, CloudQueryRow};
use strato_tests::TestMesh;

fn response_rows(inbox: &[CloudMessage]) -> Vec<CloudQueryRow> {
    inbox
        .iter()
        .find_map(|m| match m {
            CloudMessage::GetResponse { result } => Some(result.rows.clone()),
            _ => None,
        })
        .expect("no get response in inbox")
}

fn notifications(inbox: &[CloudMessage]) -> Vec<(bool, CloudQueryRow)> {
    inbox
        .iter()
        .filter_map(|m| match m {
            CloudMessage::SubscriptionNotification { was_updated, row } => {
                Some((*was_updated, row.clone()))
            }
            _ => None,
        })
        .collect()
}

#[test]
fn write_then_read_single_node() {
    let mut mesh = TestMesh::with_nodes(1);
    let server = mesh.node_guids()[0];
    let writer = mesh.add_client(server);
    let reader = mesh.add_client(server);

    mesh.post(writer, CloudKey::new(1, 0), b"hello");
    mesh.get(reader, CloudKey::new(1, 0));

    let rows = response_rows(&mesh.client_inbox(reader));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload, Bytes::from_static(b"hello"));
    assert_eq!(rows[0].client_guid, writer);
    assert_eq!(rows[0].key, CloudKey::new(1, 0));
    mesh.check_all();
}

#[test]
fn overwrite_by_same_client_wins() {
    let mut mesh = TestMesh::with_nodes(1);
    let server = mesh.node_guids()[0];
    let writer = mesh.add_client(server);
    let reader = mesh.add_client(server);
    let key = CloudKey::new(4, 2);

    mesh.post(writer, key, b"first");
    mesh.post(writer, key, b"second");
    mesh.get(reader, key);

    let rows = response_rows(&mesh.client_inbox(reader));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload, Bytes::from_static(b"second"));
    mesh.check_all();
}

#[test]
fn subscription_fan_out_update_then_removal() {
    let mut mesh = TestMesh::with_nodes(1);
    let server = mesh.node_guids()[0];
    let writer = mesh.add_client(server);
    let subscriber = mesh.add_client(server);
    let key = CloudKey::new(7, 7);
    let payload = [0x42u8; 64];

    mesh.subscribe(subscriber, key, vec![]);
    mesh.client_inbox(subscriber); // drop the subscribe's own response

    mesh.post(writer, key, &payload);
    let updates = notifications(&mesh.client_inbox(subscriber));
    assert_eq!(updates.len(), 1);
    assert!(updates[0].0);
    assert_eq!(updates[0].1.payload.as_ref(), &payload[..]);
    assert_eq!(updates[0].1.client_guid, writer);

    mesh.client_send(
        writer,
        CloudMessage::Release { keys: vec![key] },
    );
    let removals = notifications(&mesh.client_inbox(subscriber));
    assert_eq!(removals.len(), 1);
    assert!(!removals[0].0);

    // The released key is no longer readable.
    mesh.get(subscriber, key);
    let inbox = mesh.client_inbox(subscriber);
    assert!(response_rows(&inbox).is_empty());
    mesh.check_all();
}

#[test]
fn upload_quota_rejects_and_retains_prior_post() {
    let mut mesh = TestMesh::new();
    let server = mesh.add_node(CloudConfig {
        max_upload_bytes_per_client: 1000,
        ..Default::default()
    });
    let writer = mesh.add_client(server);
    let reader = mesh.add_client(server);

    mesh.post(writer, CloudKey::new(1, 0), &[1u8; 600]);
    mesh.post(writer, CloudKey::new(2, 0), &[2u8; 500]);
    mesh.check_all();

    // First upload intact.
    mesh.get(reader, CloudKey::new(1, 0));
    let rows = response_rows(&mesh.client_inbox(reader));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload.len(), 600);

    // Second upload was silently dropped.
    mesh.get(reader, CloudKey::new(2, 0));
    let rows = response_rows(&mesh.client_inbox(reader));
    assert!(rows.is_empty());
}

#[test]
fn specific_subscription_only_notifies_for_named_owner() {
    let mut mesh = TestMesh::with_nodes(1);
    let server = mesh.node_guids()[0];
    let owner_x = mesh.add_client(server);
    let owner_y = mesh.add_client(server);
    let subscriber = mesh.add_client(server);
    let key = CloudKey::new(2, 2);

    mesh.subscribe(subscriber, key, vec![owner_x]);
    mesh.client_inbox(subscriber);

    mesh.post(owner_x, key, b"from x");
    mesh.post(owner_y, key, b"from y");

    let updates = notifications(&mesh.client_inbox(subscriber));
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1.client_guid, owner_x);
    mesh.check_all();
}

#[test]
fn non_specific_subscription_supersedes_specific() {
    let mut mesh = TestMesh::with_nodes(1);
    let server = mesh.node_guids()[0];
    let owner_x = mesh.add_client(server);
    let owner_y = mesh.add_client(server);
    let subscriber = mesh.add_client(server);
    let key = CloudKey::new(2, 2);

    mesh.subscribe(subscriber, key, vec![owner_x]);
    // Re-subscribing with no owner filter widens the subscription.
    mesh.subscribe(subscriber, key, vec![]);
    mesh.client_inbox(subscriber);
    mesh.check_all();

    mesh.post(owner_x, key, b"from x");
    mesh.post(owner_y, key, b"from y");

    let updates = notifications(&mesh.client_inbox(subscriber));
    assert_eq!(updates.len(), 2);
    mesh.check_all();
}

#[test]
fn unsubscribed_client_hears_nothing() {
    let mut mesh = TestMesh::with_nodes(1);
    let server = mesh.node_guids()[0];
    let writer = mesh.add_client(server);
    let subscriber = mesh.add_client(server);
    let key = CloudKey::new(3, 1);

    mesh.subscribe(subscriber, key, vec![]);
    mesh.client_send(
        subscriber,
        CloudMessage::Unsubscribe {
            keys: vec![key],
            specific_systems: vec![],
        },
    );
    mesh.client_inbox(subscriber);

    mesh.post(writer, key, b"data");
    assert!(notifications(&mesh.client_inbox(subscriber)).is_empty());
    mesh.check_all();
}

#[test]
fn duplicate_keys_in_query_duplicate_rows() {
    let mut mesh = TestMesh::with_nodes(1);
    let server = mesh.node_guids()[0];
    let writer = mesh.add_client(server);
    let reader = mesh.add_client(server);
    let key = CloudKey::new(6, 6);

    mesh.post(writer, key, b"dup");
    mesh.client_send(
        reader,
        CloudMessage::Get {
            query: strato_proto::CloudQueryWithOrigins {
                query: strato_proto::CloudQuery {
                    keys: vec![key, key],
                    ..Default::default()
                },
                specific_systems: vec![],
            },
        },
    );
    let rows = response_rows(&mesh.client_inbox(reader));
    assert_eq!(rows.len(), 2);
}

#[test]
fn client_disconnect_behaves_like_release() {
    let mut mesh = TestMesh::with_nodes(1);
    let server = mesh.node_guids()[0];
    let writer = mesh.add_client(server);
    let subscriber = mesh.add_client(server);
    let key = CloudKey::new(9, 9);

    mesh.subscribe(subscriber, key, vec![]);
    mesh.client_inbox(subscriber);
    mesh.post(writer, key, b"going away");
    mesh.client_inbox(subscriber);

    mesh.disconnect_client(writer);
    let removals = notifications(&mesh.client_inbox(subscriber));
    assert_eq!(removals.len(), 1);
    assert!(!removals[0].0);

    mesh.get(subscriber, key);
    assert!(response_rows(&mesh.client_inbox(subscriber)).is_empty());
    mesh.check_all();
}
