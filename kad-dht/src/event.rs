// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Events emitted on the service's stream.
//!
//! Delivery is lossy by design: a slow consumer drops events rather than
//! backpressuring the DHT.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::peer::PeerId;

/// Identifier of one lookup, unique within the process.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl QueryId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", self.0)
    }
}

/// Operating mode of the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Serves inbound requests.
    Server,
    /// Queries the network but silently closes inbound streams.
    Client,
    /// Serves, and may be switched to `Server` by the host once it knows the
    /// node is reachable. The core never promotes itself.
    Automatic,
}

/// How a finished query ended, in event form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutcomeSummary {
    Nodes { count: usize },
    Record { found: bool },
    Providers { count: usize },
    Stored { to_peers: usize },
    Announced { to_peers: usize },
}

/// Everything the service reports to its host.
#[derive(Clone, Debug)]
pub enum KadEvent {
    Started,
    Stopped,
    ModeChanged {
        new_mode: Mode,
    },
    PeerAdded {
        peer: PeerId,
        bucket: usize,
    },
    PeerRemoved {
        peer: PeerId,
    },
    PeerUpdated {
        peer: PeerId,
    },
    RoutingTableRefreshed {
        bucket: usize,
    },
    QueryStarted {
        id: QueryId,
        kind: &'static str,
    },
    QueryProgress {
        id: QueryId,
        contacted: usize,
    },
    QuerySucceeded {
        id: QueryId,
        outcome: QueryOutcomeSummary,
    },
    QueryFailed {
        id: QueryId,
        error: String,
    },
    RecordStored {
        key: Vec<u8>,
    },
    RecordRetrieved {
        key: Vec<u8>,
        from: PeerId,
    },
    RecordNotFound {
        key: Vec<u8>,
    },
    RecordRepublished {
        key: Vec<u8>,
    },
    RecordRejected {
        key: Vec<u8>,
        reason: String,
    },
    ProviderAdded {
        key: Vec<u8>,
        provider: PeerId,
    },
    ProviderRemoved {
        key: Vec<u8>,
        provider: PeerId,
    },
    ProviderAnnounced {
        key: Vec<u8>,
    },
    ProvidersFound {
        key: Vec<u8>,
        count: usize,
    },
    RequestReceived {
        peer: PeerId,
        kind: &'static str,
    },
    ResponseSent {
        peer: PeerId,
    },
    MaintenanceCompleted {
        records_removed: usize,
        providers_removed: usize,
    },
    RefreshStarted,
    RefreshCompleted {
        refreshed: usize,
    },
}
