// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! A Kademlia DHT subsystem for a peer-to-peer host.
//!
//! Three coupled services over one XOR key space: locating the peers closest
//! to a key, storing and retrieving records, and advertising content
//! providers. The host supplies transport capabilities (a stream opener and a
//! protocol handler registry). The 256-bucket routing table, the iterative
//! lookup engine with its S/Kademlia hardening, the TTL-bounded stores and
//! the background maintenance loops all live here.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use kad_dht::{KadConfig, KadService, PeerId, StreamOpener};
//! # async fn example(opener: Arc<dyn StreamOpener>) -> kad_dht::Result<()> {
//! let local = PeerId::new(vec![1, 2, 3]);
//! let (service, events) = KadService::new(local, opener, KadConfig::default());
//! service.start_maintenance();
//! service.start_refresh();
//!
//! let record = service.get_value(b"/ipns/someone").await?;
//! # let _ = (record, events);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod ipns;
pub mod kbucket;
pub mod key;
pub mod latency;
pub mod peer;
pub mod query;
pub mod routing_table;
pub mod service;
pub mod store;
pub mod transport;
pub mod validator;
pub mod wire;

pub use config::{KadConfig, SecurityConfig, ValidationFailurePolicy, K_VALUE, PROTOCOL_NAME};
pub use error::{KadError, Result};
pub use event::{KadEvent, Mode, QueryId, QueryOutcomeSummary};
pub use key::KadKey;
pub use peer::{PeerAddr, PeerId, PeerInfo};
pub use query::{KadQuery, QueryConfig, QueryDelegate, QueryKind, QueryOutcome};
pub use routing_table::RoutingTable;
pub use service::{KadService, ServiceStats};
pub use store::{ProviderRecord, ProviderStore, Record, RecordStore};
pub use transport::{HandlerRegistry, InboundStreamHandler, KadStream, StreamOpener};
pub use validator::{
    AcceptAllValidator, CompositeValidator, DefaultValidator, NamespaceFallback,
    NamespacedValidator, RecordValidator,
};

pub use ipns::IpnsValidator;
