// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The DHT service: protocol handler, public operations, background loops.
//!
//! The service is the only long-lived aggregate. It owns the routing table,
//! both stores and the latency tracker; queries borrow the table to seed
//! themselves and call back through a delegate for per-peer RPCs. Background
//! loops hold weak handles so shutdown never races a reference cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{KadConfig, ValidationFailurePolicy, PROTOCOL_NAME};
use crate::error::{KadError, Result};
use crate::event::{KadEvent, Mode, QueryId, QueryOutcomeSummary};
use crate::kbucket::InsertOutcome;
use crate::key::KadKey;
use crate::latency::PeerLatencyTracker;
use crate::peer::{PeerAddr, PeerId, PeerInfo};
use crate::query::{KadQuery, QueryConfig, QueryDelegate, QueryKind, QueryOutcome};
use crate::routing_table::RoutingTable;
use crate::store::{
    MemoryProviderBackend, MemoryRecordBackend, ProviderBackend, ProviderRecord,
    ProviderStore, ProviderStoreConfig, Record, RecordBackend, RecordStore, RecordStoreConfig,
};
use crate::transport::{HandlerRegistry, InboundStreamHandler, KadStream, StreamOpener};
use crate::validator::RecordValidator;
use crate::wire::{self, pb::message::MessageType, KadRequest, KadResponse};

/// Counters the service keeps about itself.
#[derive(Default)]
struct Counters {
    queries_started: AtomicU64,
    queries_succeeded: AtomicU64,
    queries_failed: AtomicU64,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    peer_attempts: AtomicU64,
}

/// Point-in-time view of the service's statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceStats {
    pub queries_started: u64,
    pub queries_succeeded: u64,
    pub queries_failed: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    /// Outbound per-peer RPC attempts. Inbound traffic never touches this.
    pub peer_attempts: u64,
    pub routing_table_size: usize,
    pub records_stored: usize,
    pub provider_keys: usize,
}

struct ServiceInner {
    config: KadConfig,
    local_peer: PeerId,
    routing_table: RoutingTable,
    records: RecordStore,
    providers: ProviderStore,
    latency: PeerLatencyTracker,
    /// Validates inbound PUT_VALUE records.
    inbound_validator: Option<Arc<dyn RecordValidator>>,
    /// Drives record selection in lookups; absent means legacy first-wins.
    selection_validator: Option<Arc<dyn RecordValidator>>,
    opener: Arc<dyn StreamOpener>,
    mode: Mutex<Mode>,
    events: Mutex<Option<mpsc::Sender<KadEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

/// The Kademlia DHT service.
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct KadService {
    inner: Arc<ServiceInner>,
}

impl KadService {
    /// Builds a service with in-memory stores and no record validator.
    pub fn new(
        local_peer: PeerId,
        opener: Arc<dyn StreamOpener>,
        config: KadConfig,
    ) -> (Self, mpsc::Receiver<KadEvent>) {
        let record_backend = Box::new(MemoryRecordBackend::new(RecordStoreConfig {
            max_records: config.max_records,
            default_ttl: config.record_ttl,
        }));
        let provider_backend = Box::new(MemoryProviderBackend::new(ProviderStoreConfig {
            max_keys: config.max_provider_keys,
            max_providers_per_key: config.max_providers_per_key,
            default_ttl: config.provider_ttl,
        }));
        Self::with_parts(local_peer, opener, config, record_backend, provider_backend, None)
    }

    /// Builds a service over explicit store backends and an optional
    /// validator. A configured validator both gates inbound records and
    /// selects among records found by lookups.
    pub fn with_parts(
        local_peer: PeerId,
        opener: Arc<dyn StreamOpener>,
        config: KadConfig,
        record_backend: Box<dyn RecordBackend>,
        provider_backend: Box<dyn ProviderBackend>,
        validator: Option<Arc<dyn RecordValidator>>,
    ) -> (Self, mpsc::Receiver<KadEvent>) {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        let inner = Arc::new(ServiceInner {
            routing_table: RoutingTable::new(
                local_peer.clone(),
                config.k,
                config.pending_cache_size,
            ),
            records: RecordStore::new(record_backend),
            providers: ProviderStore::new(provider_backend),
            latency: PeerLatencyTracker::new(config.latency_max_peers),
            inbound_validator: validator.clone(),
            selection_validator: validator,
            opener,
            mode: Mutex::new(Mode::Automatic),
            events: Mutex::new(Some(tx)),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
            local_peer,
            config,
        });
        inner.emit(KadEvent::Started);
        (Self { inner }, rx)
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    pub fn mode(&self) -> Mode {
        *self.inner.mode.lock()
    }

    /// Switches the operating mode. The host calls this once it learns the
    /// node is (un)reachable; the core never promotes itself.
    pub fn set_mode(&self, mode: Mode) {
        *self.inner.mode.lock() = mode;
        info!(?mode, "DHT mode changed");
        self.inner.emit(KadEvent::ModeChanged { new_mode: mode });
    }

    /// Registers the protocol handler with the host's registry.
    pub fn register(&self, registry: &dyn HandlerRegistry) {
        registry.register(
            PROTOCOL_NAME,
            Arc::new(ServiceHandler {
                inner: Arc::clone(&self.inner),
            }),
        );
    }

    /// Seeds the routing table with a known peer, e.g. a bootstrap node.
    pub fn add_address(&self, peer: PeerId, addresses: Vec<PeerAddr>) {
        self.inner.observe_peer(&PeerInfo::new(peer, addresses));
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        if self.inner.routing_table.remove_peer(peer).is_some() {
            self.inner.emit(KadEvent::PeerRemoved { peer: peer.clone() });
        }
    }

    pub fn stats(&self) -> ServiceStats {
        let inner = &self.inner;
        ServiceStats {
            queries_started: inner.counters.queries_started.load(Ordering::Relaxed),
            queries_succeeded: inner.counters.queries_succeeded.load(Ordering::Relaxed),
            queries_failed: inner.counters.queries_failed.load(Ordering::Relaxed),
            requests_received: inner.counters.requests_received.load(Ordering::Relaxed),
            responses_sent: inner.counters.responses_sent.load(Ordering::Relaxed),
            peer_attempts: inner.counters.peer_attempts.load(Ordering::Relaxed),
            routing_table_size: inner.routing_table.len(),
            records_stored: inner.records.len(),
            provider_keys: inner.providers.key_count(),
        }
    }

    /// The K peers closest to `target` that the network knows of.
    pub async fn find_node(&self, target: KadKey) -> Result<Vec<PeerInfo>> {
        let (id, outcome) = self.inner.run_query(QueryKind::FindNode(target)).await?;
        match outcome {
            QueryOutcome::Nodes(nodes) => {
                self.inner.emit(KadEvent::QuerySucceeded {
                    id,
                    outcome: QueryOutcomeSummary::Nodes { count: nodes.len() },
                });
                Ok(nodes)
            }
            _ => Err(KadError::QueryFailed(
                "find_node produced a non-node result".into(),
            )),
        }
    }

    /// Fetches a record, checking the local store before going to the
    /// network. Remote hits are cached locally.
    pub async fn get_value(&self, key: &[u8]) -> Result<Record> {
        if let Some(record) = self.inner.records.get(key) {
            self.inner.emit(KadEvent::RecordRetrieved {
                key: key.to_vec(),
                from: self.inner.local_peer.clone(),
            });
            return Ok(record);
        }

        let (id, outcome) = self
            .inner
            .run_query(QueryKind::GetValue(key.to_vec()))
            .await?;
        match outcome {
            QueryOutcome::Value {
                record: Some(record),
                from,
                ..
            } => {
                self.inner
                    .records
                    .put(record.clone(), self.inner.config.record_ttl);
                self.inner.emit(KadEvent::QuerySucceeded {
                    id,
                    outcome: QueryOutcomeSummary::Record { found: true },
                });
                if let Some(from) = from {
                    self.inner.emit(KadEvent::RecordRetrieved {
                        key: key.to_vec(),
                        from,
                    });
                }
                Ok(record)
            }
            QueryOutcome::Value { record: None, .. } => {
                self.inner.emit(KadEvent::QuerySucceeded {
                    id,
                    outcome: QueryOutcomeSummary::Record { found: false },
                });
                self.inner
                    .emit(KadEvent::RecordNotFound { key: key.to_vec() });
                Err(KadError::RecordNotFound)
            }
            _ => Err(KadError::QueryFailed(
                "get_value produced a non-value result".into(),
            )),
        }
    }

    /// Stores a record locally and on the K closest peers. Returns how many
    /// remote peers acknowledged; the local copy persists regardless.
    pub async fn put_value(&self, key: Vec<u8>, value: Vec<u8>) -> Result<usize> {
        if let Some(validator) = &self.inner.inbound_validator {
            validator.validate(&key, &value)?;
        }

        let record = Record::new(key.clone(), value).with_time_received(Utc::now());
        self.inner
            .records
            .put(record.clone(), self.inner.config.record_ttl);
        self.inner.emit(KadEvent::RecordStored { key: key.clone() });

        let (id, nodes) = match self
            .inner
            .run_query(QueryKind::FindNode(KadKey::from_hash(&key)))
            .await
        {
            Ok((id, QueryOutcome::Nodes(nodes))) => (id, nodes),
            Ok(_) => {
                return Err(KadError::QueryFailed(
                    "put_value lookup produced a non-node result".into(),
                ))
            }
            // An empty table still keeps the local copy.
            Err(KadError::NoPeersAvailable) => return Ok(0),
            Err(err) => return Err(err),
        };

        let stored_to = self.inner.fan_out_put(&record, &nodes).await;
        self.inner.emit(KadEvent::QuerySucceeded {
            id,
            outcome: QueryOutcomeSummary::Stored { to_peers: stored_to },
        });
        Ok(stored_to)
    }

    /// Finds providers for a content key, merging local registrations with
    /// the network's answer.
    pub async fn get_providers(&self, key: &[u8]) -> Result<Vec<PeerInfo>> {
        let mut found: Vec<PeerInfo> = self
            .inner
            .providers
            .providers(key)
            .into_iter()
            .map(|p| PeerInfo::new(p.provider, p.addresses))
            .collect();

        match self
            .inner
            .run_query(QueryKind::GetProviders(key.to_vec()))
            .await
        {
            Ok((id, QueryOutcome::Providers { providers, .. })) => {
                for info in providers {
                    if !found.iter().any(|p| p.peer == info.peer) {
                        found.push(info);
                    }
                }
                self.inner.emit(KadEvent::QuerySucceeded {
                    id,
                    outcome: QueryOutcomeSummary::Providers { count: found.len() },
                });
            }
            Ok(_) => {
                return Err(KadError::QueryFailed(
                    "get_providers produced a non-provider result".into(),
                ))
            }
            // Local-only answers are still answers.
            Err(KadError::NoPeersAvailable) if !found.is_empty() => {}
            Err(err) if found.is_empty() => return Err(err),
            Err(err) => {
                debug!(%err, "provider lookup failed; serving local registrations");
            }
        }

        self.inner.emit(KadEvent::ProvidersFound {
            key: key.to_vec(),
            count: found.len(),
        });
        if found.is_empty() {
            return Err(KadError::ProviderNotFound);
        }
        Ok(found)
    }

    /// Announces the local node as a provider for a content key. Returns how
    /// many peers took the announcement.
    pub async fn provide(&self, key: Vec<u8>) -> Result<usize> {
        self.inner.register_local_provider(&key);

        let (id, nodes) = match self
            .inner
            .run_query(QueryKind::FindNode(KadKey::from_hash(&key)))
            .await
        {
            Ok((id, QueryOutcome::Nodes(nodes))) => (id, nodes),
            Ok(_) => {
                return Err(KadError::QueryFailed(
                    "provide lookup produced a non-node result".into(),
                ))
            }
            Err(KadError::NoPeersAvailable) => return Ok(0),
            Err(err) => return Err(err),
        };

        let announced_to = self.inner.fan_out_provider(&key, &nodes).await;
        self.inner
            .emit(KadEvent::ProviderAnnounced { key: key.clone() });
        self.inner.emit(KadEvent::QuerySucceeded {
            id,
            outcome: QueryOutcomeSummary::Announced {
                to_peers: announced_to,
            },
        });
        Ok(announced_to)
    }

    /// Withdraws the local provider registration for a content key. Remote
    /// registrations age out on their own TTL.
    pub fn stop_providing(&self, key: &[u8]) {
        if self.inner.providers.remove(key, &self.inner.local_peer) {
            self.inner.emit(KadEvent::ProviderRemoved {
                key: key.to_vec(),
                provider: self.inner.local_peer.clone(),
            });
        }
    }

    /// Starts the store cleanup loop.
    pub fn start_maintenance(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.cleanup_interval;
        self.spawn_task(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                inner.run_maintenance();
            }
        });
    }

    /// Starts the bucket refresh loop.
    pub fn start_refresh(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.bucket_refresh_interval;
        self.spawn_task(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                inner.run_refresh().await;
            }
        });
    }

    /// Starts the record/provider republish loop.
    pub fn start_republish(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.record_republish_interval;
        self.spawn_task(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                inner.run_republish().await;
            }
        });
    }

    fn spawn_task(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        self.inner.tasks.lock().push(tokio::spawn(future));
    }

    /// Cancels background loops, emits `Stopped` and finishes the event
    /// stream. In-flight inbound streams are left to run out on their own.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.emit(KadEvent::Stopped);
        self.inner.events.lock().take();
        info!("DHT service stopped");
    }

    /// One immediate maintenance pass; the loop normally does this.
    pub fn run_maintenance_now(&self) {
        self.inner.run_maintenance();
    }

    /// One immediate refresh pass; the loop normally does this.
    pub async fn run_refresh_now(&self) {
        self.inner.run_refresh().await;
    }

    /// One immediate republish pass; the loop normally does this.
    pub async fn run_republish_now(&self) {
        self.inner.run_republish().await;
    }
}

impl ServiceInner {
    fn emit(&self, event: KadEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            // Slow consumers lose events rather than stalling the DHT.
            let _ = tx.try_send(event);
        }
    }

    /// Folds a peer sighting into the routing table.
    fn observe_peer(&self, info: &PeerInfo) {
        let bucket = self
            .routing_table
            .local_key()
            .distance(&KadKey::from_peer(&info.peer))
            .bucket_index();
        match self
            .routing_table
            .add_peer(info.peer.clone(), info.addresses.clone())
        {
            Ok(InsertOutcome::Inserted) => {
                self.emit(KadEvent::PeerAdded {
                    peer: info.peer.clone(),
                    bucket: bucket.unwrap_or(0),
                });
            }
            Ok(InsertOutcome::Updated) => {
                self.emit(KadEvent::PeerUpdated {
                    peer: info.peer.clone(),
                });
            }
            Ok(InsertOutcome::Pending) | Err(_) => {}
        }
    }

    fn effective_alpha(&self) -> usize {
        if !self.config.dynamic_alpha {
            return self.config.alpha;
        }
        let alpha = self.config.alpha as f64;
        let scaled = match self.latency.overall_success_rate() {
            Some(rate) if rate > 0.8 => alpha * (rate / 0.8),
            Some(rate) if rate < 0.5 => alpha * (rate / 0.5),
            _ => alpha,
        };
        (scaled.round() as usize).clamp(self.config.min_alpha, self.config.max_alpha)
    }

    /// Seeds and runs one lookup; emits start/failure events and keeps the
    /// counters. Success events are the caller's job since only it knows the
    /// operation-level summary.
    async fn run_query(self: &Arc<Self>, kind: QueryKind) -> Result<(QueryId, QueryOutcome)> {
        let target = kind.target();
        let seeds: Vec<PeerInfo> = self
            .routing_table
            .closest_peers(&target, self.config.k, &[])
            .into_iter()
            .map(|entry| PeerInfo::new(entry.peer, entry.addresses))
            .collect();

        let id = QueryId::next();
        self.counters.queries_started.fetch_add(1, Ordering::Relaxed);
        self.emit(KadEvent::QueryStarted {
            id,
            kind: kind.label(),
        });

        let config = QueryConfig {
            alpha: self.effective_alpha(),
            k: self.config.k,
            timeout: self.config.query_timeout,
            max_iterations: self.config.max_iterations,
            strict_depth: false,
        };
        let mut query = KadQuery::new(kind, config, seeds).with_security(self.config.security);
        if let Some(validator) = &self.selection_validator {
            query = query.with_validator(Arc::clone(validator));
        }

        let delegate = NetworkDelegate {
            inner: Arc::clone(self),
            query_id: id,
            contacted: AtomicU64::new(0),
        };
        match query.run(&delegate).await {
            Ok(outcome) => {
                self.counters
                    .queries_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                Ok((id, outcome))
            }
            Err(err) => {
                self.counters.queries_failed.fetch_add(1, Ordering::Relaxed);
                self.emit(KadEvent::QueryFailed {
                    id,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// PUT_VALUE fan-out; the task group never exceeds `k` members.
    async fn fan_out_put(self: &Arc<Self>, record: &Record, nodes: &[PeerInfo]) -> usize {
        let attempts = nodes.iter().take(self.config.k).map(|peer| {
            let request = KadRequest::PutValue {
                record: record.clone(),
            };
            async move {
                match self.request(peer, request, MessageType::PutValue).await {
                    Ok(KadResponse::PutAck) => true,
                    Ok(_) => false,
                    Err(err) => {
                        debug!(peer = %peer.peer, %err, "PUT_VALUE fan-out failed");
                        false
                    }
                }
            }
        });
        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }

    /// ADD_PROVIDER fan-out; the message has no response body.
    async fn fan_out_provider(self: &Arc<Self>, key: &[u8], nodes: &[PeerInfo]) -> usize {
        let local = PeerInfo::new(self.local_peer.clone(), self.config.external_addresses.clone());
        let attempts = nodes.iter().take(self.config.k).map(|peer| {
            let request = KadRequest::AddProvider {
                key: key.to_vec(),
                providers: vec![local.clone()],
            };
            async move {
                match self.send_one_way(peer, request).await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(peer = %peer.peer, %err, "ADD_PROVIDER fan-out failed");
                        false
                    }
                }
            }
        });
        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }

    fn register_local_provider(&self, key: &[u8]) {
        self.providers.add(
            key,
            ProviderRecord {
                provider: self.local_peer.clone(),
                addresses: self.config.external_addresses.clone(),
            },
            self.config.provider_ttl,
        );
        self.emit(KadEvent::ProviderAdded {
            key: key.to_vec(),
            provider: self.local_peer.clone(),
        });
    }

    /// One request/response exchange on a fresh stream, bounded by the
    /// peer's suggested timeout. The stream is closed on every exit path.
    async fn request(
        self: &Arc<Self>,
        peer: &PeerInfo,
        request: KadRequest,
        expecting: MessageType,
    ) -> Result<KadResponse> {
        self.counters.peer_attempts.fetch_add(1, Ordering::Relaxed);
        let budget = self
            .latency
            .suggested_timeout(&peer.peer, self.config.peer_timeout);
        let started = Instant::now();

        let exchange = async {
            let mut stream = self.opener.new_stream(&peer.peer, PROTOCOL_NAME).await?;
            wire::write_message(&mut stream, &request.into_pb()).await?;
            let reply = wire::read_message(&mut stream, self.config.max_message_size).await;
            if let Err(err) = stream.shutdown().await {
                debug!(peer = %peer.peer, %err, "stream close failed");
            }
            KadResponse::from_pb(reply?, expecting)
        };

        match timeout(budget, exchange).await {
            Ok(Ok(response)) => {
                self.latency.record_success(&peer.peer, started.elapsed());
                self.observe_peer(peer);
                Ok(response)
            }
            Ok(Err(err)) => {
                self.latency.record_failure(&peer.peer);
                Err(err)
            }
            Err(_) => {
                self.latency.record_failure(&peer.peer);
                Err(KadError::Timeout(budget))
            }
        }
    }

    /// Writes one message and closes; used for ADD_PROVIDER.
    async fn send_one_way(self: &Arc<Self>, peer: &PeerInfo, request: KadRequest) -> Result<()> {
        self.counters.peer_attempts.fetch_add(1, Ordering::Relaxed);
        let budget = self
            .latency
            .suggested_timeout(&peer.peer, self.config.peer_timeout);
        let started = Instant::now();

        let exchange = async {
            let mut stream = self.opener.new_stream(&peer.peer, PROTOCOL_NAME).await?;
            wire::write_message(&mut stream, &request.into_pb()).await?;
            if let Err(err) = stream.shutdown().await {
                debug!(peer = %peer.peer, %err, "stream close failed");
            }
            Ok(())
        };

        match timeout(budget, exchange).await {
            Ok(Ok(())) => {
                self.latency.record_success(&peer.peer, started.elapsed());
                self.observe_peer(peer);
                Ok(())
            }
            Ok(Err(err)) => {
                self.latency.record_failure(&peer.peer);
                Err(err)
            }
            Err(_) => {
                self.latency.record_failure(&peer.peer);
                Err(KadError::Timeout(budget))
            }
        }
    }

    fn run_maintenance(&self) {
        let records_removed = self.records.cleanup();
        let providers_removed = self.providers.cleanup();
        self.latency.cleanup(Duration::from_secs(24 * 60 * 60));
        if records_removed + providers_removed > 0 {
            debug!(records_removed, providers_removed, "store cleanup");
            self.emit(KadEvent::MaintenanceCompleted {
                records_removed,
                providers_removed,
            });
        }
    }

    async fn run_refresh(self: &Arc<Self>) {
        self.emit(KadEvent::RefreshStarted);
        let mut stale = self
            .routing_table
            .buckets_needing_refresh(self.config.bucket_refresh_interval);
        stale.shuffle(&mut rand::thread_rng());
        stale.truncate(self.config.random_walk_count);

        let mut refreshed = 0;
        for bucket in stale {
            let probe = self.routing_table.random_key_for_bucket(bucket);
            match self.run_query(QueryKind::FindNode(probe)).await {
                Ok((id, QueryOutcome::Nodes(nodes))) => {
                    self.routing_table.mark_bucket_refreshed(bucket);
                    refreshed += 1;
                    self.emit(KadEvent::RoutingTableRefreshed { bucket });
                    self.emit(KadEvent::QuerySucceeded {
                        id,
                        outcome: QueryOutcomeSummary::Nodes { count: nodes.len() },
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(bucket, %err, "bucket refresh walk failed");
                }
            }
        }
        self.emit(KadEvent::RefreshCompleted { refreshed });
    }

    async fn run_republish(self: &Arc<Self>) {
        let due = self
            .records
            .records_needing_republish(self.config.record_republish_interval);
        for record in due {
            match self
                .run_query(QueryKind::FindNode(KadKey::from_hash(&record.key)))
                .await
            {
                Ok((_, QueryOutcome::Nodes(nodes))) => {
                    let stored_to = self.fan_out_put(&record, &nodes).await;
                    if stored_to > 0 {
                        // Refresh the local expiry alongside the remote copies.
                        self.records.put(record.clone(), self.config.record_ttl);
                        self.emit(KadEvent::RecordRepublished {
                            key: record.key.clone(),
                        });
                    } else {
                        debug!("record republish reached no peers");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "record republish lookup failed");
                }
            }
        }

        let due_keys = self.providers.keys_needing_republish(
            &self.local_peer,
            self.config.provider_republish_interval,
        );
        for key in due_keys {
            match self
                .run_query(QueryKind::FindNode(KadKey::from_hash(&key)))
                .await
            {
                Ok((_, QueryOutcome::Nodes(nodes))) => {
                    let announced = self.fan_out_provider(&key, &nodes).await;
                    if announced > 0 {
                        self.register_local_provider(&key);
                        self.emit(KadEvent::ProviderAnnounced { key });
                    } else {
                        debug!("provider announcement reached no peers");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "provider republish lookup failed");
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, remote: PeerInfo, mut stream: KadStream) {
        if *self.mode.lock() == Mode::Client {
            // Client mode drops inbound streams without reading a byte.
            debug!(peer = %remote.peer, "closing inbound stream in client mode");
            return;
        }

        self.observe_peer(&remote);

        let message = match timeout(
            self.config.peer_timeout,
            wire::read_message(&mut stream, self.config.max_message_size),
        )
        .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => {
                debug!(peer = %remote.peer, %err, "failed to read inbound message");
                return;
            }
            Err(_) => {
                debug!(peer = %remote.peer, "inbound stream timed out");
                return;
            }
        };

        let request = match KadRequest::from_pb(message) {
            Ok(request) => request,
            Err(err) => {
                debug!(peer = %remote.peer, %err, "terminating inbound stream");
                return;
            }
        };

        self.counters
            .requests_received
            .fetch_add(1, Ordering::Relaxed);
        self.emit(KadEvent::RequestReceived {
            peer: remote.peer.clone(),
            kind: request.label(),
        });

        let response = match self.dispatch_inbound(&remote, &request) {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(err) => {
                debug!(peer = %remote.peer, %err, "terminating inbound stream");
                return;
            }
        };

        match timeout(
            self.config.peer_timeout,
            wire::write_message(&mut stream, &response.into_pb(&request)),
        )
        .await
        {
            Ok(Ok(())) => {
                self.counters.responses_sent.fetch_add(1, Ordering::Relaxed);
                self.emit(KadEvent::ResponseSent {
                    peer: remote.peer.clone(),
                });
            }
            Ok(Err(err)) => debug!(peer = %remote.peer, %err, "failed to write response"),
            Err(_) => debug!(peer = %remote.peer, "response write timed out"),
        }
    }

    /// Serves one decoded request. `Ok(None)` means the request takes no
    /// response body; an error tears the stream down.
    fn dispatch_inbound(
        &self,
        remote: &PeerInfo,
        request: &KadRequest,
    ) -> Result<Option<KadResponse>> {
        match request {
            KadRequest::FindNode { key } => {
                let target = KadKey::validating(key).map_err(|err| match err {
                    KadError::InvalidKeyLength { actual, expected } => KadError::ProtocolViolation(
                        format!(
                            "Invalid key length in FIND_NODE: expected {expected} bytes, got {actual}"
                        ),
                    ),
                    other => other,
                })?;
                Ok(Some(KadResponse::Nodes {
                    closer_peers: self.closer_peers(&target, &remote.peer),
                }))
            }
            KadRequest::GetValue { key } => Ok(Some(KadResponse::Value {
                record: self.records.get(key),
                closer_peers: self.closer_peers(&KadKey::from_hash(key), &remote.peer),
            })),
            KadRequest::PutValue { record } => self.handle_inbound_put(record),
            KadRequest::GetProviders { key } => Ok(Some(KadResponse::Providers {
                providers: self
                    .providers
                    .providers(key)
                    .into_iter()
                    .map(|p| PeerInfo::new(p.provider, p.addresses))
                    .collect(),
                closer_peers: self.closer_peers(&KadKey::from_hash(key), &remote.peer),
            })),
            KadRequest::AddProvider { key, providers } => {
                for info in providers {
                    self.providers.add(
                        key,
                        ProviderRecord {
                            provider: info.peer.clone(),
                            addresses: info.addresses.clone(),
                        },
                        self.config.provider_ttl,
                    );
                    self.emit(KadEvent::ProviderAdded {
                        key: key.clone(),
                        provider: info.peer.clone(),
                    });
                }
                Ok(None)
            }
        }
    }

    fn handle_inbound_put(&self, record: &Record) -> Result<Option<KadResponse>> {
        let verdict = match &self.inbound_validator {
            Some(validator) => validator.validate(&record.key, &record.value),
            None => Ok(()),
        };

        match verdict {
            Ok(()) => {
                self.store_inbound_record(record);
                Ok(Some(KadResponse::PutAck))
            }
            Err(err) => {
                self.emit(KadEvent::RecordRejected {
                    key: record.key.clone(),
                    reason: err.to_string(),
                });
                match self.config.on_validation_failure {
                    ValidationFailurePolicy::Reject => Err(err),
                    ValidationFailurePolicy::IgnoreAndLog => {
                        warn!(%err, "dropping invalid record, acknowledging anyway");
                        Ok(Some(KadResponse::PutAck))
                    }
                    ValidationFailurePolicy::AcceptWithWarning => {
                        warn!(%err, "storing record that failed validation");
                        self.store_inbound_record(record);
                        Ok(Some(KadResponse::PutAck))
                    }
                }
            }
        }
    }

    fn store_inbound_record(&self, record: &Record) {
        let mut record = record.clone();
        record.time_received.get_or_insert_with(Utc::now);
        if self.records.put(record.clone(), self.config.record_ttl) {
            self.emit(KadEvent::RecordStored { key: record.key });
        }
    }

    fn closer_peers(&self, target: &KadKey, asking: &PeerId) -> Vec<PeerInfo> {
        self.routing_table
            .closest_peers(target, self.config.k, std::slice::from_ref(asking))
            .into_iter()
            .map(|entry| PeerInfo::new(entry.peer, entry.addresses))
            .collect()
    }
}

/// Protocol callback handed to the host's registry.
struct ServiceHandler {
    inner: Arc<ServiceInner>,
}

#[async_trait]
impl InboundStreamHandler for ServiceHandler {
    async fn handle_stream(&self, remote: PeerInfo, stream: KadStream) {
        Arc::clone(&self.inner).handle_inbound(remote, stream).await;
    }
}

/// The thin object queries use to reach the network: its only capabilities
/// are the three per-peer RPCs, implemented over the service's opener.
struct NetworkDelegate {
    inner: Arc<ServiceInner>,
    query_id: QueryId,
    contacted: AtomicU64,
}

impl NetworkDelegate {
    fn note_contact(&self) {
        let contacted = self.contacted.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.emit(KadEvent::QueryProgress {
            id: self.query_id,
            contacted: contacted as usize,
        });
    }
}

#[async_trait]
impl QueryDelegate for NetworkDelegate {
    async fn send_find_node(&self, peer: &PeerInfo, target: &KadKey) -> Result<Vec<PeerInfo>> {
        let request = KadRequest::FindNode {
            key: target.to_bytes().to_vec(),
        };
        let response = self
            .inner
            .request(peer, request, MessageType::FindNode)
            .await?;
        self.note_contact();
        match response {
            KadResponse::Nodes { closer_peers } => Ok(closer_peers),
            _ => Err(KadError::QueryFailed(
                "FIND_NODE reply had the wrong shape".into(),
            )),
        }
    }

    async fn send_get_value(
        &self,
        peer: &PeerInfo,
        key: &[u8],
    ) -> Result<(Option<Record>, Vec<PeerInfo>)> {
        let request = KadRequest::GetValue { key: key.to_vec() };
        let response = self
            .inner
            .request(peer, request, MessageType::GetValue)
            .await?;
        self.note_contact();
        match response {
            KadResponse::Value {
                record,
                closer_peers,
            } => Ok((record, closer_peers)),
            _ => Err(KadError::QueryFailed(
                "GET_VALUE reply had the wrong shape".into(),
            )),
        }
    }

    async fn send_get_providers(
        &self,
        peer: &PeerInfo,
        key: &[u8],
    ) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
        let request = KadRequest::GetProviders { key: key.to_vec() };
        let response = self
            .inner
            .request(peer, request, MessageType::GetProviders)
            .await?;
        self.note_contact();
        match response {
            KadResponse::Providers {
                providers,
                closer_peers,
            } => Ok((providers, closer_peers)),
            _ => Err(KadError::QueryFailed(
                "GET_PROVIDERS reply had the wrong shape".into(),
            )),
        }
    }
}
