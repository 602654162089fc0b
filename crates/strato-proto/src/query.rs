//! Query, row and result types.
//!
//! These are shared by both ends of the protocol: a client builds a
//! `CloudQuery`, the server answers with a `CloudQueryResult`, and rows
//! travel inside get responses, aggregation responses and change
//! notifications alike.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use strato_core::{CloudKey, DecodeError, PeerAddress, PeerGuid, WireDecode, WireEncode};

/// A read request against the cloud store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudQuery {
    /// Keys to look up, in the order rows should be returned.
    pub keys: Vec<CloudKey>,
    /// Maximum rows to return across all keys; 0 means unlimited.
    pub max_rows: u32,
    /// Rows to skip before returning any.
    pub starting_row: u32,
    /// Whether the requester also subscribes to future changes.
    pub subscribe_to_results: bool,
}

impl CloudQuery {
    /// A query for a single key with no pagination.
    pub fn for_key(key: CloudKey) -> Self {
        Self {
            keys: vec![key],
            ..Default::default()
        }
    }
}

impl WireEncode for CloudQuery {
    fn encode(&self, buf: &mut BytesMut) {
        write_key_list(&self.keys, buf);
        self.max_rows.encode(buf);
        self.starting_row.encode(buf);
        self.subscribe_to_results.encode(buf);
    }
}

impl WireDecode for CloudQuery {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            keys: read_key_list(buf)?,
            max_rows: u32::decode(buf)?,
            starting_row: u32::decode(buf)?,
            subscribe_to_results: bool::decode(buf)?,
        })
    }
}

/// A query plus the owner filter it applies.
///
/// An empty `specific_systems` list means the query (and any subscription
/// it installs) applies to every owner of the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudQueryWithOrigins {
    /// The query itself.
    pub query: CloudQuery,
    /// Owners to restrict to; empty means all owners.
    pub specific_systems: Vec<PeerGuid>,
}

impl WireEncode for CloudQueryWithOrigins {
    fn encode(&self, buf: &mut BytesMut) {
        self.query.encode(buf);
        write_guid_list(&self.specific_systems, buf);
    }
}

impl WireDecode for CloudQueryWithOrigins {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            query: CloudQuery::decode(buf)?,
            specific_systems: read_guid_list(buf)?,
        })
    }
}

/// One `(key, owner, payload, coordinates)` tuple.
///
/// Rows are returned by queries and carried in change notifications. The
/// origin coordinates let a reader contact the uploader or its server
/// directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudQueryRow {
    /// Key the payload was published under.
    pub key: CloudKey,
    /// The payload itself. Empty for removal notifications.
    pub payload: Bytes,
    /// Address of the server holding the entry authoritatively.
    pub server_address: PeerAddress,
    /// Address of the uploading client.
    pub client_address: PeerAddress,
    /// Guid of the authoritative server.
    pub server_guid: PeerGuid,
    /// Guid of the uploading client (the owner).
    pub client_guid: PeerGuid,
}

impl WireEncode for CloudQueryRow {
    fn encode(&self, buf: &mut BytesMut) {
        self.key.encode(buf);
        self.payload.encode(buf);
        self.server_address.encode(buf);
        self.client_address.encode(buf);
        self.server_guid.encode(buf);
        self.client_guid.encode(buf);
    }
}

impl WireDecode for CloudQueryRow {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            key: CloudKey::decode(buf)?,
            payload: Bytes::decode(buf)?,
            server_address: PeerAddress::decode(buf)?,
            client_address: PeerAddress::decode(buf)?,
            server_guid: PeerGuid::decode(buf)?,
            client_guid: PeerGuid::decode(buf)?,
        })
    }
}

/// The answer to a `CloudQuery`: the echoed query plus matching rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudQueryResult {
    /// The query this result answers.
    pub query: CloudQuery,
    /// Matching rows, already paginated.
    pub rows: Vec<CloudQueryRow>,
}

impl WireEncode for CloudQueryResult {
    fn encode(&self, buf: &mut BytesMut) {
        self.query.encode(buf);
        write_row_list(&self.rows, buf);
    }
}

impl WireDecode for CloudQueryResult {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            query: CloudQuery::decode(buf)?,
            rows: read_row_list(buf)?,
        })
    }
}

// List framing helpers. Key and guid lists are u16-counted, row lists
// u32-counted, per the protocol.

pub(crate) fn write_key_list(keys: &[CloudKey], buf: &mut BytesMut) {
    debug_assert!(keys.len() <= u16::MAX as usize);
    buf.put_u16(keys.len() as u16);
    for key in keys {
        key.encode(buf);
    }
}

pub(crate) fn read_key_list(buf: &mut Bytes) -> Result<Vec<CloudKey>, DecodeError> {
    let count = u16::decode(buf)? as usize;
    if buf.remaining() < count * 8 {
        return Err(DecodeError::LengthOverrun {
            declared: count * 8,
            remaining: buf.remaining(),
        });
    }
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(CloudKey::decode(buf)?);
    }
    Ok(keys)
}

pub(crate) fn write_guid_list(guids: &[PeerGuid], buf: &mut BytesMut) {
    debug_assert!(guids.len() <= u16::MAX as usize);
    buf.put_u16(guids.len() as u16);
    for guid in guids {
        guid.encode(buf);
    }
}

pub(crate) fn read_guid_list(buf: &mut Bytes) -> Result<Vec<PeerGuid>, DecodeError> {
    let count = u16::decode(buf)? as usize;
    if buf.remaining() < count * 8 {
        return Err(DecodeError::LengthOverrun {
            declared: count * 8,
            remaining: buf.remaining(),
        });
    }
    let mut guids = Vec::with_capacity(count);
    for _ in 0..count {
        guids.push(PeerGuid::decode(buf)?);
    }
    Ok(guids)
}

pub(crate) fn write_row_list(rows: &[CloudQueryRow], buf: &mut BytesMut) {
    debug_assert!(rows.len() <= u32::MAX as usize);
    buf.put_u32(rows.len() as u32);
    for row in rows {
        row.encode(buf);
    }
}

pub(crate) fn read_row_list(buf: &mut Bytes) -> Result<Vec<CloudQueryRow>, DecodeError> {
    let count = u32::decode(buf)? as usize;
    // Each row is at least 38 bytes (key 8, len 4, two v4 addresses 7
    // each, two guids 8 each); bound the preallocation by that.
    let mut rows = Vec::with_capacity(count.min(buf.remaining() / 38 + 1));
    for _ in 0..count {
        rows.push(CloudQueryRow::decode(buf)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> CloudQueryRow {
        CloudQueryRow {
            key: CloudKey::new(7, 7),
            payload: Bytes::from_static(b"payload"),
            server_address: PeerAddress::new("10.0.0.1:4242".parse().unwrap()),
            client_address: PeerAddress::new("10.0.0.2:5151".parse().unwrap()),
            server_guid: PeerGuid::new(0x1111),
            client_guid: PeerGuid::new(0x2222),
        }
    }

    #[test]
    fn query_roundtrip() {
        let query = CloudQuery {
            keys: vec![CloudKey::new(1, 2), CloudKey::new(3, 4)],
            max_rows: 10,
            starting_row: 2,
            subscribe_to_results: true,
        };
        let decoded = CloudQuery::from_bytes(&query.to_vec()).unwrap();
        assert_eq!(query, decoded);
    }

    #[test]
    fn query_with_origins_roundtrip() {
        let q = CloudQueryWithOrigins {
            query: CloudQuery::for_key(CloudKey::new(9, 1)),
            specific_systems: vec![PeerGuid::new(5), PeerGuid::new(6)],
        };
        let decoded = CloudQueryWithOrigins::from_bytes(&q.to_vec()).unwrap();
        assert_eq!(q, decoded);
    }

    #[test]
    fn row_roundtrip() {
        let row = sample_row();
        let decoded = CloudQueryRow::from_bytes(&row.to_vec()).unwrap();
        assert_eq!(row, decoded);
    }

    #[test]
    fn result_roundtrip() {
        let result = CloudQueryResult {
            query: CloudQuery::for_key(CloudKey::new(7, 7)),
            rows: vec![sample_row(), sample_row()],
        };
        let decoded = CloudQueryResult::from_bytes(&result.to_vec()).unwrap();
        assert_eq!(result, decoded);
    }

    #[test]
    fn truncated_key_list_rejected() {
        // Declares 4 keys, supplies 1.
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        CloudKey::new(1, 1).encode(&mut buf);
        let err = read_key_list(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::LengthOverrun { .. }));
    }

    #[test]
    fn hostile_row_count_does_not_preallocate() {
        // Declares u32::MAX rows with an empty body; must error, not OOM.
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        let err = read_row_list(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::InsufficientBytes { .. }));
    }
}
