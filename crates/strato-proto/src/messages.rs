//! Message framing and payload definitions.
//!
//! Every packet starts with a one-byte message tag. The server-to-server
//! family shares a single top-level tag and carries its own subcommand
//! byte, so a transport can route the whole family to the federation
//! handler without decoding further.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use strato_core::{CloudKey, DecodeError, PeerGuid, WireDecode, WireEncode};

use crate::query::{
    read_guid_list, read_key_list, read_row_list, write_guid_list, write_key_list,
    write_row_list, CloudQueryResult, CloudQueryRow, CloudQueryWithOrigins,
};

/// Top-level message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Client uploads a payload under a key
    Post = 0,
    /// Client releases keys it uploaded
    Release = 1,
    /// Client reads keys, optionally subscribing
    Get = 2,
    /// Client cancels subscriptions
    Unsubscribe = 3,
    /// Server answers a get
    GetResponse = 4,
    /// Server notifies a subscriber of a change
    SubscriptionNotification = 5,
    /// Server-to-server federation family
    ServerToServer = 6,
}

impl MessageKind {
    /// Returns the tag byte.
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Creates from a tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(MessageKind::Post),
            1 => Ok(MessageKind::Release),
            2 => Ok(MessageKind::Get),
            3 => Ok(MessageKind::Unsubscribe),
            4 => Ok(MessageKind::GetResponse),
            5 => Ok(MessageKind::SubscriptionNotification),
            6 => Ok(MessageKind::ServerToServer),
            other => Err(DecodeError::InvalidTag(other as u32)),
        }
    }
}

/// Subcommand tags within the server-to-server family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerCommandKind {
    /// Fan-out sub-query toward a peer holding data
    ProcessGetRequest = 0,
    /// Rows answering a fan-out sub-query
    ProcessGetResponse = 1,
    /// Initial handshake snapshot of key sets
    UploadedAndSubscribedKeys = 2,
    /// A key gained its first local uploader
    AddUploadedKey = 3,
    /// A key gained its first local subscriber
    AddSubscribedKey = 4,
    /// A key lost its last local uploader
    RemoveUploadedKey = 5,
    /// A key lost its last local subscriber
    RemoveSubscribedKey = 6,
    /// A row changed under a key the peer subscribes to
    DataChanged = 7,
}

impl ServerCommandKind {
    /// Returns the subcommand byte.
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Creates from a subcommand byte.
    pub fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(ServerCommandKind::ProcessGetRequest),
            1 => Ok(ServerCommandKind::ProcessGetResponse),
            2 => Ok(ServerCommandKind::UploadedAndSubscribedKeys),
            3 => Ok(ServerCommandKind::AddUploadedKey),
            4 => Ok(ServerCommandKind::AddSubscribedKey),
            5 => Ok(ServerCommandKind::RemoveUploadedKey),
            6 => Ok(ServerCommandKind::RemoveSubscribedKey),
            7 => Ok(ServerCommandKind::DataChanged),
            other => Err(DecodeError::InvalidTag(other as u32)),
        }
    }
}

/// A message on the cloud protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudMessage {
    /// Client uploads a payload under a key.
    Post {
        /// Key to publish under
        key: CloudKey,
        /// The payload
        payload: Bytes,
    },
    /// Client releases keys it previously uploaded.
    Release {
        /// Keys to release
        keys: Vec<CloudKey>,
    },
    /// Client reads keys, optionally subscribing to future changes.
    Get {
        /// The query and its owner filter
        query: CloudQueryWithOrigins,
    },
    /// Client cancels subscriptions on keys, globally or per owner.
    Unsubscribe {
        /// Keys to unsubscribe from
        keys: Vec<CloudKey>,
        /// Owners to unsubscribe from; empty means all
        specific_systems: Vec<PeerGuid>,
    },
    /// Server answers a get.
    GetResponse {
        /// The echoed query and its rows
        result: CloudQueryResult,
    },
    /// Server notifies a subscriber of a change.
    SubscriptionNotification {
        /// True for an upload or overwrite, false for a removal
        was_updated: bool,
        /// The changed row
        row: CloudQueryRow,
    },
    /// Server-to-server federation command.
    ServerToServer {
        /// The subcommand
        command: ServerCommand,
    },
}

impl CloudMessage {
    /// Returns the top-level message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            CloudMessage::Post { .. } => MessageKind::Post,
            CloudMessage::Release { .. } => MessageKind::Release,
            CloudMessage::Get { .. } => MessageKind::Get,
            CloudMessage::Unsubscribe { .. } => MessageKind::Unsubscribe,
            CloudMessage::GetResponse { .. } => MessageKind::GetResponse,
            CloudMessage::SubscriptionNotification { .. } => {
                MessageKind::SubscriptionNotification
            }
            CloudMessage::ServerToServer { .. } => MessageKind::ServerToServer,
        }
    }
}

impl WireEncode for CloudMessage {
    fn encode(&self, buf: &mut BytesMut) {
        self.kind().tag().encode(buf);
        match self {
            CloudMessage::Post { key, payload } => {
                key.encode(buf);
                payload.encode(buf);
            }
            CloudMessage::Release { keys } => {
                write_key_list(keys, buf);
            }
            CloudMessage::Get { query } => {
                query.encode(buf);
            }
            CloudMessage::Unsubscribe {
                keys,
                specific_systems,
            } => {
                write_key_list(keys, buf);
                write_guid_list(specific_systems, buf);
            }
            CloudMessage::GetResponse { result } => {
                result.encode(buf);
            }
            CloudMessage::SubscriptionNotification { was_updated, row } => {
                was_updated.encode(buf);
                row.encode(buf);
            }
            CloudMessage::ServerToServer { command } => {
                command.encode(buf);
            }
        }
    }
}

impl WireDecode for CloudMessage {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let kind = MessageKind::from_tag(u8::decode(buf)?)?;
        Ok(match kind {
            MessageKind::Post => CloudMessage::Post {
                key: CloudKey::decode(buf)?,
                payload: Bytes::decode(buf)?,
            },
            MessageKind::Release => CloudMessage::Release {
                keys: read_key_list(buf)?,
            },
            MessageKind::Get => CloudMessage::Get {
                query: CloudQueryWithOrigins::decode(buf)?,
            },
            MessageKind::Unsubscribe => CloudMessage::Unsubscribe {
                keys: read_key_list(buf)?,
                specific_systems: read_guid_list(buf)?,
            },
            MessageKind::GetResponse => CloudMessage::GetResponse {
                result: CloudQueryResult::decode(buf)?,
            },
            MessageKind::SubscriptionNotification => CloudMessage::SubscriptionNotification {
                was_updated: bool::decode(buf)?,
                row: CloudQueryRow::decode(buf)?,
            },
            MessageKind::ServerToServer => CloudMessage::ServerToServer {
                command: ServerCommand::decode(buf)?,
            },
        })
    }
}

/// A federation subcommand between two servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerCommand {
    /// Fan-out sub-query toward a peer that advertises data.
    ProcessGetRequest {
        /// The query to run against the peer's local store
        query: CloudQueryWithOrigins,
        /// Correlation id assigned by the originating server
        request_id: u32,
    },
    /// Rows answering a fan-out sub-query.
    ProcessGetResponse {
        /// Correlation id echoed back
        request_id: u32,
        /// The peer's local rows
        rows: Vec<CloudQueryRow>,
    },
    /// Initial handshake snapshot of a peer's key sets.
    UploadedAndSubscribedKeys {
        /// Keys with at least one local uploader at the sender
        uploaded: Vec<CloudKey>,
        /// Keys with at least one local subscriber at the sender
        subscribed: Vec<CloudKey>,
    },
    /// A key gained its first local uploader at the sender.
    AddUploadedKey {
        /// The key
        key: CloudKey,
    },
    /// A key gained its first local subscriber at the sender.
    AddSubscribedKey {
        /// The key
        key: CloudKey,
    },
    /// A key lost its last local uploader at the sender.
    RemoveUploadedKey {
        /// The key
        key: CloudKey,
    },
    /// A key lost its last local subscriber at the sender.
    RemoveSubscribedKey {
        /// The key
        key: CloudKey,
    },
    /// A row changed under a key the receiver subscribes to.
    DataChanged {
        /// True for an upload or overwrite, false for a removal
        was_updated: bool,
        /// The changed row
        row: CloudQueryRow,
    },
}

impl ServerCommand {
    /// Returns the subcommand kind.
    pub fn kind(&self) -> ServerCommandKind {
        match self {
            ServerCommand::ProcessGetRequest { .. } => ServerCommandKind::ProcessGetRequest,
            ServerCommand::ProcessGetResponse { .. } => ServerCommandKind::ProcessGetResponse,
            ServerCommand::UploadedAndSubscribedKeys { .. } => {
                ServerCommandKind::UploadedAndSubscribedKeys
            }
            ServerCommand::AddUploadedKey { .. } => ServerCommandKind::AddUploadedKey,
            ServerCommand::AddSubscribedKey { .. } => ServerCommandKind::AddSubscribedKey,
            ServerCommand::RemoveUploadedKey { .. } => ServerCommandKind::RemoveUploadedKey,
            ServerCommand::RemoveSubscribedKey { .. } => ServerCommandKind::RemoveSubscribedKey,
            ServerCommand::DataChanged { .. } => ServerCommandKind::DataChanged,
        }
    }
}

impl WireEncode for ServerCommand {
    fn encode(&self, buf: &mut BytesMut) {
        self.kind().tag().encode(buf);
        match self {
            ServerCommand::ProcessGetRequest { query, request_id } => {
                query.encode(buf);
                request_id.encode(buf);
            }
            ServerCommand::ProcessGetResponse { request_id, rows } => {
                request_id.encode(buf);
                write_row_list(rows, buf);
            }
            ServerCommand::UploadedAndSubscribedKeys {
                uploaded,
                subscribed,
            } => {
                write_key_list(uploaded, buf);
                write_key_list(subscribed, buf);
            }
            ServerCommand::AddUploadedKey { key }
            | ServerCommand::AddSubscribedKey { key }
            | ServerCommand::RemoveUploadedKey { key }
            | ServerCommand::RemoveSubscribedKey { key } => {
                key.encode(buf);
            }
            ServerCommand::DataChanged { was_updated, row } => {
                was_updated.encode(buf);
                row.encode(buf);
            }
        }
    }
}

impl WireDecode for ServerCommand {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let kind = ServerCommandKind::from_tag(u8::decode(buf)?)?;
        Ok(match kind {
            ServerCommandKind::ProcessGetRequest => ServerCommand::ProcessGetRequest {
                query: CloudQueryWithOrigins::decode(buf)?,
                request_id: u32::decode(buf)?,
            },
            ServerCommandKind::ProcessGetResponse => ServerCommand::ProcessGetResponse {
                request_id: u32::decode(buf)?,
                rows: read_row_list(buf)?,
            },
            ServerCommandKind::UploadedAndSubscribedKeys => {
                ServerCommand::UploadedAndSubscribedKeys {
                    uploaded: read_key_list(buf)?,
                    subscribed: read_key_list(buf)?,
                }
            }
            ServerCommandKind::AddUploadedKey => ServerCommand::AddUploadedKey {
                key: CloudKey::decode(buf)?,
            },
            ServerCommandKind::AddSubscribedKey => ServerCommand::AddSubscribedKey {
                key: CloudKey::decode(buf)?,
            },
            ServerCommandKind::RemoveUploadedKey => ServerCommand::RemoveUploadedKey {
                key: CloudKey::decode(buf)?,
            },
            ServerCommandKind::RemoveSubscribedKey => ServerCommand::RemoveSubscribedKey {
                key: CloudKey::decode(buf)?,
            },
            ServerCommandKind::DataChanged => ServerCommand::DataChanged {
                was_updated: bool::decode(buf)?,
                row: CloudQueryRow::decode(buf)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::CloudQuery;
    use strato_core::{PeerAddress, PeerGuid};

    fn sample_row() -> CloudQueryRow {
        CloudQueryRow {
            key: CloudKey::new(1, 0),
            payload: Bytes::from_static(b"hello"),
            server_address: PeerAddress::new("127.0.0.1:4242".parse().unwrap()),
            client_address: PeerAddress::new("127.0.0.1:5151".parse().unwrap()),
            server_guid: PeerGuid::new(10),
            client_guid: PeerGuid::new(20),
        }
    }

    #[test]
    fn post_roundtrip() {
        let msg = CloudMessage::Post {
            key: CloudKey::new(1, 0),
            payload: Bytes::from_static(b"hello"),
        };
        let decoded = CloudMessage::from_bytes(&msg.to_vec()).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(decoded.kind(), MessageKind::Post);
    }

    #[test]
    fn get_roundtrip() {
        let msg = CloudMessage::Get {
            query: CloudQueryWithOrigins {
                query: CloudQuery {
                    keys: vec![CloudKey::new(9, 1)],
                    max_rows: 5,
                    starting_row: 0,
                    subscribe_to_results: true,
                },
                specific_systems: vec![PeerGuid::new(77)],
            },
        };
        let decoded = CloudMessage::from_bytes(&msg.to_vec()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn notification_roundtrip() {
        let msg = CloudMessage::SubscriptionNotification {
            was_updated: false,
            row: sample_row(),
        };
        let decoded = CloudMessage::from_bytes(&msg.to_vec()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn server_command_roundtrips() {
        let commands = vec![
            ServerCommand::ProcessGetRequest {
                query: CloudQueryWithOrigins {
                    query: CloudQuery::for_key(CloudKey::new(9, 1)),
                    specific_systems: vec![],
                },
                request_id: 42,
            },
            ServerCommand::ProcessGetResponse {
                request_id: 42,
                rows: vec![sample_row()],
            },
            ServerCommand::UploadedAndSubscribedKeys {
                uploaded: vec![CloudKey::new(1, 1)],
                subscribed: vec![CloudKey::new(2, 2), CloudKey::new(3, 3)],
            },
            ServerCommand::AddUploadedKey {
                key: CloudKey::new(4, 4),
            },
            ServerCommand::RemoveSubscribedKey {
                key: CloudKey::new(5, 5),
            },
            ServerCommand::DataChanged {
                was_updated: true,
                row: sample_row(),
            },
        ];

        for command in commands {
            let msg = CloudMessage::ServerToServer { command };
            let decoded = CloudMessage::from_bytes(&msg.to_vec()).unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = CloudMessage::from_bytes(&[0xFF]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidTag(0xFF)));
    }

    #[test]
    fn unknown_subcommand_rejected() {
        let err = CloudMessage::from_bytes(&[6, 0xEE]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidTag(0xEE)));
    }

    #[test]
    fn truncated_message_rejected() {
        let msg = CloudMessage::Post {
            key: CloudKey::new(1, 0),
            payload: Bytes::from_static(b"hello"),
        };
        let bytes = msg.to_vec();
        let err = CloudMessage::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, DecodeError::LengthOverrun { .. }));
    }
}
