// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Configuration for the DHT service and its queries.

use std::time::Duration;

use crate::peer::PeerAddr;

/// Protocol identifier negotiated for DHT streams.
pub const PROTOCOL_NAME: &str = "/ipfs/kad/1.0.0";

/// Replication factor and bucket size (`K`).
pub const K_VALUE: usize = 20;

/// Default lookup parallelism (`alpha`).
pub const ALPHA_VALUE: usize = 3;

/// Number of buckets in the 256-bit key space.
pub const MAX_BUCKETS: usize = 256;

/// What to do with an inbound PUT_VALUE the validator rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationFailurePolicy {
    /// Terminate the exchange without acknowledging.
    Reject,
    /// Acknowledge but drop the record, logging the rejection.
    IgnoreAndLog,
    /// Store the record anyway, logging a warning.
    AcceptWithWarning,
}

/// S/Kademlia hardening knobs for lookups.
#[derive(Clone, Copy, Debug)]
pub struct SecurityConfig {
    /// Number of disjoint lookup paths. Values below 2 disable disjoint
    /// routing.
    pub disjoint_paths: usize,
    /// Extra candidates per wave drawn from bucket strata other than the
    /// closest ones. Zero disables sibling broadcast.
    pub sibling_count: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            disjoint_paths: 1,
            sibling_count: 0,
        }
    }
}

/// Configuration for the DHT service.
#[derive(Clone, Debug)]
pub struct KadConfig {
    /// Bucket size and replication factor (typically 20).
    pub k: usize,
    /// Lookup parallelism per wave.
    pub alpha: usize,
    /// Size of the per-bucket pending replacement cache.
    pub pending_cache_size: usize,
    /// Bound on one stream open + request/response exchange.
    pub peer_timeout: Duration,
    /// Bound on a whole iterative lookup.
    pub query_timeout: Duration,
    /// Maximum lookup waves before the engine gives up.
    pub max_iterations: usize,
    /// Maximum wire message size; larger frames are rejected unread.
    pub max_message_size: usize,
    /// Time a stored record stays alive without a re-put.
    pub record_ttl: Duration,
    /// Time a provider registration stays alive without re-announcement.
    pub provider_ttl: Duration,
    /// Cadence of the republish loop; also the record republish threshold.
    pub record_republish_interval: Duration,
    /// Age after which local provider registrations are re-announced.
    pub provider_republish_interval: Duration,
    /// Age after which a non-empty bucket counts as stale.
    pub bucket_refresh_interval: Duration,
    /// Cadence of the store cleanup loop.
    pub cleanup_interval: Duration,
    /// Number of stale buckets probed per refresh tick.
    pub random_walk_count: usize,
    /// Record store capacity.
    pub max_records: usize,
    /// Provider store capacity in distinct content keys.
    pub max_provider_keys: usize,
    /// Providers remembered per content key.
    pub max_providers_per_key: usize,
    /// Peers tracked by the latency tracker.
    pub latency_max_peers: usize,
    /// Scale `alpha` with the observed RPC success rate.
    pub dynamic_alpha: bool,
    /// Lower clamp for dynamic `alpha`.
    pub min_alpha: usize,
    /// Upper clamp for dynamic `alpha`.
    pub max_alpha: usize,
    /// Lookup hardening.
    pub security: SecurityConfig,
    /// Policy for validator-rejected inbound records.
    pub on_validation_failure: ValidationFailurePolicy,
    /// Addresses announced alongside local provider registrations. Address
    /// discovery belongs to the transport; this may stay empty.
    pub external_addresses: Vec<PeerAddr>,
    /// Capacity of the event stream; events beyond it are dropped.
    pub event_buffer: usize,
}

impl Default for KadConfig {
    fn default() -> Self {
        Self {
            k: K_VALUE,
            alpha: ALPHA_VALUE,
            pending_cache_size: 3,
            peer_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(60),
            max_iterations: 20,
            max_message_size: 1024 * 1024,
            record_ttl: Duration::from_secs(36 * 60 * 60),
            provider_ttl: Duration::from_secs(24 * 60 * 60),
            record_republish_interval: Duration::from_secs(60 * 60),
            provider_republish_interval: Duration::from_secs(22 * 60 * 60),
            bucket_refresh_interval: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            random_walk_count: 3,
            max_records: 1024,
            max_provider_keys: 1024,
            max_providers_per_key: K_VALUE,
            latency_max_peers: 1000,
            dynamic_alpha: false,
            min_alpha: 1,
            max_alpha: 10,
            security: SecurityConfig::default(),
            on_validation_failure: ValidationFailurePolicy::Reject,
            external_addresses: Vec::new(),
            event_buffer: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = KadConfig::default();
        assert_eq!(config.k, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.record_ttl, Duration::from_secs(129_600));
        assert_eq!(config.provider_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_message_size, 1_048_576);
    }
}
