// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Error types for the Kademlia DHT subsystem.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KadError>;

/// Errors surfaced by DHT operations.
///
/// Per-peer RPC failures never reach callers directly; the query engine marks
/// the peer failed and moves on. What does surface here is the behavioural
/// taxonomy: key validation, protocol violations, codec failures, timeouts
/// and query-level outcomes.
#[derive(Error, Debug, Clone)]
pub enum KadError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { actual: usize, expected: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("no peers available to start the query")]
    NoPeersAvailable,

    #[error("record not found")]
    RecordNotFound,

    #[error("no providers found")]
    ProviderNotFound,

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("maximum query depth exceeded")]
    MaxDepthExceeded,

    #[error("the local peer cannot be routed")]
    SelfEntry,

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for KadError {
    fn from(err: std::io::Error) -> Self {
        KadError::Io(err.to_string())
    }
}

impl From<prost::DecodeError> for KadError {
    fn from(err: prost::DecodeError) -> Self {
        KadError::Encoding(err.to_string())
    }
}
