// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Capabilities the DHT consumes from its host.
//!
//! The core never touches sockets. It is handed a [`StreamOpener`] to reach
//! remote peers and registers a callback with a [`HandlerRegistry`] for
//! inbound streams; multiplexing, transports and protocol negotiation all
//! live behind these two traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::peer::{PeerId, PeerInfo};

/// A negotiated bidirectional stream to a single peer.
pub type KadStream = Box<dyn DuplexStream>;

/// Marker for the stream types the DHT can drive.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// Opens outbound streams under a negotiated protocol.
#[async_trait]
pub trait StreamOpener: Send + Sync + 'static {
    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<KadStream>;
}

/// Receives inbound streams for a registered protocol.
///
/// `remote` carries the dialer's identity and its observed address, which the
/// DHT feeds straight into the routing table.
#[async_trait]
pub trait InboundStreamHandler: Send + Sync + 'static {
    async fn handle_stream(&self, remote: PeerInfo, stream: KadStream);
}

/// Registry the host exposes for protocol handlers.
pub trait HandlerRegistry: Send + Sync + 'static {
    fn register(&self, protocol: &'static str, handler: Arc<dyn InboundStreamHandler>);
}
