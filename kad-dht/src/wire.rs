// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Wire protocol: protobuf messages, varint framing, typed views.
//!
//! Field numbers are normative for `/ipfs/kad/1.0.0` interop; the message
//! structs are hand-derived prost types rather than build-time generated ones
//! so builds never need a protoc toolchain.

use bytes::BytesMut;
use chrono::SecondsFormat;
use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{KadError, Result};
use crate::peer::{PeerAddr, PeerId, PeerInfo};
use crate::store::Record;

/// Protobuf schema for DHT messages.
pub mod pb {
    /// The single message shape exchanged on a DHT stream.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Message {
        #[prost(enumeration = "message::MessageType", tag = "1")]
        pub r#type: i32,
        #[prost(message, optional, tag = "3")]
        pub record: Option<message::Record>,
        #[prost(message, repeated, tag = "8")]
        pub closer_peers: Vec<message::Peer>,
        #[prost(message, repeated, tag = "9")]
        pub provider_peers: Vec<message::Peer>,
        #[prost(bytes = "vec", tag = "10")]
        pub key: Vec<u8>,
    }

    pub mod message {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Peer {
            #[prost(bytes = "vec", tag = "1")]
            pub id: Vec<u8>,
            #[prost(bytes = "vec", repeated, tag = "2")]
            pub addrs: Vec<Vec<u8>>,
            #[prost(enumeration = "ConnectionType", tag = "3")]
            pub connection: i32,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Record {
            #[prost(bytes = "vec", tag = "1")]
            pub key: Vec<u8>,
            #[prost(bytes = "vec", tag = "2")]
            pub value: Vec<u8>,
            #[prost(string, tag = "5")]
            pub time_received: String,
        }

        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum MessageType {
            PutValue = 0,
            GetValue = 1,
            AddProvider = 2,
            GetProviders = 3,
            FindNode = 4,
            Ping = 5,
        }

        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum ConnectionType {
            NotConnected = 0,
            Connected = 1,
            CanConnect = 2,
            CannotConnect = 3,
        }
    }
}

use pb::message::{ConnectionType, MessageType};

/// Reads one varint-length-prefixed message.
///
/// The length prefix is checked against `max_size` before any of the body is
/// consumed; oversize frames fail without reading further.
pub async fn read_message<S>(io: &mut S, max_size: usize) -> Result<pb::Message>
where
    S: AsyncRead + Unpin,
{
    let len = read_varint(io).await?;
    if len > max_size as u64 {
        return Err(KadError::Encoding(format!(
            "message length {len} exceeds limit of {max_size} bytes"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    Ok(pb::Message::decode(&buf[..])?)
}

/// Writes one varint-length-prefixed message and flushes.
pub async fn write_message<S>(io: &mut S, msg: &pb::Message) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(msg.encoded_len() + 4);
    msg.encode_length_delimited(&mut buf)
        .map_err(|err| KadError::Encoding(err.to_string()))?;
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

async fn read_varint<S>(io: &mut S) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = io.read_u8().await?;
        if shift >= 63 && byte > 1 {
            return Err(KadError::Encoding("length prefix overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 70 {
            return Err(KadError::Encoding("length prefix too long".into()));
        }
    }
}

/// A decoded, validated inbound request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KadRequest {
    FindNode { key: Vec<u8> },
    GetValue { key: Vec<u8> },
    PutValue { record: Record },
    GetProviders { key: Vec<u8> },
    AddProvider { key: Vec<u8>, providers: Vec<PeerInfo> },
}

impl KadRequest {
    /// Short label used in logs and events.
    pub fn label(&self) -> &'static str {
        match self {
            KadRequest::FindNode { .. } => "FIND_NODE",
            KadRequest::GetValue { .. } => "GET_VALUE",
            KadRequest::PutValue { .. } => "PUT_VALUE",
            KadRequest::GetProviders { .. } => "GET_PROVIDERS",
            KadRequest::AddProvider { .. } => "ADD_PROVIDER",
        }
    }

    pub fn from_pb(msg: pb::Message) -> Result<Self> {
        let msg_type = MessageType::from_i32(msg.r#type).ok_or_else(|| {
            KadError::ProtocolViolation(format!("unknown message type {}", msg.r#type))
        })?;
        match msg_type {
            MessageType::FindNode => Ok(KadRequest::FindNode { key: msg.key }),
            MessageType::GetValue => Ok(KadRequest::GetValue { key: msg.key }),
            MessageType::PutValue => {
                let record = msg.record.ok_or_else(|| {
                    KadError::ProtocolViolation("PUT_VALUE without a record".into())
                })?;
                Ok(KadRequest::PutValue {
                    record: record_from_pb(record),
                })
            }
            MessageType::GetProviders => Ok(KadRequest::GetProviders { key: msg.key }),
            MessageType::AddProvider => Ok(KadRequest::AddProvider {
                key: msg.key,
                providers: msg.provider_peers.into_iter().map(peer_from_pb).collect(),
            }),
            MessageType::Ping => Err(KadError::ProtocolViolation(
                "deprecated message type PING".into(),
            )),
        }
    }

    pub fn into_pb(self) -> pb::Message {
        match self {
            KadRequest::FindNode { key } => pb::Message {
                r#type: MessageType::FindNode as i32,
                key,
                ..pb::Message::default()
            },
            KadRequest::GetValue { key } => pb::Message {
                r#type: MessageType::GetValue as i32,
                key,
                ..pb::Message::default()
            },
            KadRequest::PutValue { record } => pb::Message {
                r#type: MessageType::PutValue as i32,
                key: record.key.clone(),
                record: Some(record_to_pb(&record)),
                ..pb::Message::default()
            },
            KadRequest::GetProviders { key } => pb::Message {
                r#type: MessageType::GetProviders as i32,
                key,
                ..pb::Message::default()
            },
            KadRequest::AddProvider { key, providers } => pb::Message {
                r#type: MessageType::AddProvider as i32,
                key,
                provider_peers: providers
                    .iter()
                    .map(|p| peer_to_pb(p, ConnectionType::Connected))
                    .collect(),
                ..pb::Message::default()
            },
        }
    }
}

/// A decoded response, interpreted against the request that was sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KadResponse {
    Nodes {
        closer_peers: Vec<PeerInfo>,
    },
    Value {
        record: Option<Record>,
        closer_peers: Vec<PeerInfo>,
    },
    Providers {
        providers: Vec<PeerInfo>,
        closer_peers: Vec<PeerInfo>,
    },
    PutAck,
}

impl KadResponse {
    /// Interprets a raw reply to a request of type `expecting`.
    pub fn from_pb(msg: pb::Message, expecting: MessageType) -> Result<Self> {
        if msg.r#type != expecting as i32 {
            return Err(KadError::QueryFailed(format!(
                "expected a {:?} reply, got message type {}",
                expecting, msg.r#type
            )));
        }
        match expecting {
            MessageType::FindNode => Ok(KadResponse::Nodes {
                closer_peers: msg.closer_peers.into_iter().map(peer_from_pb).collect(),
            }),
            MessageType::GetValue => Ok(KadResponse::Value {
                record: msg.record.map(record_from_pb),
                closer_peers: msg.closer_peers.into_iter().map(peer_from_pb).collect(),
            }),
            MessageType::GetProviders => Ok(KadResponse::Providers {
                providers: msg.provider_peers.into_iter().map(peer_from_pb).collect(),
                closer_peers: msg.closer_peers.into_iter().map(peer_from_pb).collect(),
            }),
            MessageType::PutValue => Ok(KadResponse::PutAck),
            other => Err(KadError::QueryFailed(format!(
                "message type {other:?} has no response shape"
            ))),
        }
    }

    pub fn into_pb(self, request: &KadRequest) -> pb::Message {
        let r#type = match request {
            KadRequest::FindNode { .. } => MessageType::FindNode,
            KadRequest::GetValue { .. } => MessageType::GetValue,
            KadRequest::PutValue { .. } => MessageType::PutValue,
            KadRequest::GetProviders { .. } => MessageType::GetProviders,
            KadRequest::AddProvider { .. } => MessageType::AddProvider,
        } as i32;

        match self {
            KadResponse::Nodes { closer_peers } => pb::Message {
                r#type,
                closer_peers: closer_peers
                    .iter()
                    .map(|p| peer_to_pb(p, ConnectionType::CanConnect))
                    .collect(),
                ..pb::Message::default()
            },
            KadResponse::Value {
                record,
                closer_peers,
            } => pb::Message {
                r#type,
                record: record.as_ref().map(record_to_pb),
                closer_peers: closer_peers
                    .iter()
                    .map(|p| peer_to_pb(p, ConnectionType::CanConnect))
                    .collect(),
                ..pb::Message::default()
            },
            KadResponse::Providers {
                providers,
                closer_peers,
            } => pb::Message {
                r#type,
                provider_peers: providers
                    .iter()
                    .map(|p| peer_to_pb(p, ConnectionType::CanConnect))
                    .collect(),
                closer_peers: closer_peers
                    .iter()
                    .map(|p| peer_to_pb(p, ConnectionType::CanConnect))
                    .collect(),
                ..pb::Message::default()
            },
            KadResponse::PutAck => pb::Message {
                r#type,
                key: match request {
                    KadRequest::PutValue { record } => record.key.clone(),
                    _ => Vec::new(),
                },
                ..pb::Message::default()
            },
        }
    }
}

pub fn record_to_pb(record: &Record) -> pb::message::Record {
    pb::message::Record {
        key: record.key.clone(),
        value: record.value.clone(),
        time_received: record
            .time_received
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap_or_default(),
    }
}

pub fn record_from_pb(record: pb::message::Record) -> Record {
    Record {
        key: record.key,
        value: record.value,
        time_received: chrono::DateTime::parse_from_rfc3339(&record.time_received)
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc)),
    }
}

pub fn peer_to_pb(info: &PeerInfo, connection: ConnectionType) -> pb::message::Peer {
    pb::message::Peer {
        id: info.peer.as_bytes().to_vec(),
        addrs: info.addresses.iter().map(PeerAddr::to_wire_bytes).collect(),
        connection: connection as i32,
    }
}

pub fn peer_from_pb(peer: pb::message::Peer) -> PeerInfo {
    PeerInfo {
        peer: PeerId::new(peer.id),
        addresses: peer
            .addrs
            .iter()
            .filter_map(|bytes| PeerAddr::from_wire_bytes(bytes))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_peer(id: u8) -> PeerInfo {
        PeerInfo::new(
            PeerId::new(vec![id; 4]),
            vec![PeerAddr::new("tcp", format!("10.0.0.{id}:4001"))],
        )
    }

    async fn round_trip(msg: &pb::Message) -> pb::Message {
        let mut buf = Vec::new();
        write_message(&mut buf, msg).await.unwrap();
        read_message(&mut buf.as_slice(), 1024 * 1024).await.unwrap()
    }

    #[tokio::test]
    async fn find_node_round_trip() {
        let request = KadRequest::FindNode {
            key: vec![7u8; 32],
        };
        let decoded = round_trip(&request.clone().into_pb()).await;
        assert_eq!(KadRequest::from_pb(decoded).unwrap(), request);
    }

    #[tokio::test]
    async fn value_response_round_trip_keeps_record_and_peers() {
        let record = Record::new(b"key".to_vec(), b"value".to_vec())
            .with_time_received(Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap());
        let response = KadResponse::Value {
            record: Some(record.clone()),
            closer_peers: vec![sample_peer(1), sample_peer(2)],
        };
        let request = KadRequest::GetValue { key: b"key".to_vec() };

        let decoded = round_trip(&response.clone().into_pb(&request)).await;
        let parsed = KadResponse::from_pb(decoded, MessageType::GetValue).unwrap();
        assert_eq!(parsed, response);
    }

    #[tokio::test]
    async fn providers_round_trip_carries_both_peer_lists() {
        let response = KadResponse::Providers {
            providers: vec![sample_peer(3)],
            closer_peers: vec![sample_peer(4), sample_peer(5)],
        };
        let request = KadRequest::GetProviders { key: b"c".to_vec() };

        let decoded = round_trip(&response.clone().into_pb(&request)).await;
        assert_eq!(
            KadResponse::from_pb(decoded, MessageType::GetProviders).unwrap(),
            response
        );
    }

    #[tokio::test]
    async fn ping_is_rejected() {
        let msg = pb::Message {
            r#type: MessageType::Ping as i32,
            ..pb::Message::default()
        };
        match KadRequest::from_pb(round_trip(&msg).await) {
            Err(KadError::ProtocolViolation(reason)) => assert!(reason.contains("PING")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_frames_fail_before_the_body_is_read() {
        let request = KadRequest::PutValue {
            record: Record::new(b"k".to_vec(), vec![0u8; 512]),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &request.into_pb()).await.unwrap();

        let mut reader = buf.as_slice();
        match read_message(&mut reader, 64).await {
            Err(KadError::Encoding(reason)) => assert!(reason.contains("exceeds limit")),
            other => panic!("unexpected: {other:?}"),
        }
        // The body is still unread; only the prefix was consumed.
        assert!(reader.len() >= 512);
    }

    #[tokio::test]
    async fn unknown_fields_are_skipped() {
        let request = KadRequest::GetValue { key: b"k".to_vec() };
        let mut encoded = request.clone().into_pb().encode_to_vec();
        // Append field 77 (varint wire type) which no revision of the schema
        // defines: tag = (77 << 3) | 0.
        prost::encoding::encode_varint((77 << 3) as u64, &mut encoded);
        prost::encoding::encode_varint(42, &mut encoded);

        let decoded = pb::Message::decode(&encoded[..]).unwrap();
        assert_eq!(KadRequest::from_pb(decoded).unwrap(), request);
    }

    #[tokio::test]
    async fn truncated_messages_fail_to_decode() {
        let response = KadResponse::Nodes {
            closer_peers: vec![sample_peer(1)],
        };
        let request = KadRequest::FindNode { key: vec![0u8; 32] };
        let encoded = response.into_pb(&request).encode_to_vec();

        assert!(pb::Message::decode(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn record_time_received_is_rfc3339() {
        let time = Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap();
        let pb = record_to_pb(&Record::new(b"k".to_vec(), b"v".to_vec()).with_time_received(time));
        assert!(pb.time_received.ends_with('Z'));
        assert_eq!(record_from_pb(pb).time_received, Some(time));
    }
}
