// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The iterative lookup engine.
//!
//! A lookup proceeds in waves: the `alpha` closest fresh candidates are
//! dispatched in parallel, every reply is folded back in, and the next wave
//! begins. Per-peer state only ever moves Fresh → InFlight → Ok/Failed.
//! The hardened variant splits the seed set into disjoint paths that share a
//! claim set, so no peer is ever contacted by two paths of one query.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::error::{KadError, Result};
use crate::key::KadKey;
use crate::peer::{PeerId, PeerInfo};
use crate::store::Record;
use crate::validator::RecordValidator;

/// What a lookup is after.
#[derive(Clone, Debug)]
pub enum QueryKind {
    /// The K peers closest to a key.
    FindNode(KadKey),
    /// A record stored under an opaque key.
    GetValue(Vec<u8>),
    /// Providers registered under an opaque key.
    GetProviders(Vec<u8>),
}

impl QueryKind {
    /// The key that orders candidates. Raw record/content keys are hashed
    /// into the key space first.
    pub fn target(&self) -> KadKey {
        match self {
            QueryKind::FindNode(key) => *key,
            QueryKind::GetValue(key) | QueryKind::GetProviders(key) => KadKey::from_hash(key),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueryKind::FindNode(_) => "find_node",
            QueryKind::GetValue(_) => "get_value",
            QueryKind::GetProviders(_) => "get_providers",
        }
    }
}

/// Per-query tuning.
#[derive(Clone, Debug)]
pub struct QueryConfig {
    pub alpha: usize,
    pub k: usize,
    pub timeout: Duration,
    pub max_iterations: usize,
    /// Fail with `MaxDepthExceeded` instead of returning the best-effort
    /// nearest set when the wave budget runs out.
    pub strict_depth: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            alpha: 3,
            k: 20,
            timeout: Duration::from_secs(60),
            max_iterations: 20,
            strict_depth: false,
        }
    }
}

/// Performs the per-peer RPCs a lookup needs. Implemented by the service in
/// terms of its stream opener; mocked out in tests.
#[async_trait]
pub trait QueryDelegate: Send + Sync {
    async fn send_find_node(&self, peer: &PeerInfo, target: &KadKey) -> Result<Vec<PeerInfo>>;

    async fn send_get_value(
        &self,
        peer: &PeerInfo,
        key: &[u8],
    ) -> Result<(Option<Record>, Vec<PeerInfo>)>;

    async fn send_get_providers(
        &self,
        peer: &PeerInfo,
        key: &[u8],
    ) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)>;
}

/// Result of a finished lookup.
#[derive(Clone, Debug)]
pub enum QueryOutcome {
    Nodes(Vec<PeerInfo>),
    Value {
        record: Option<Record>,
        /// Which peer served the record.
        from: Option<PeerId>,
        closest: Vec<PeerInfo>,
    },
    Providers {
        providers: Vec<PeerInfo>,
        closest: Vec<PeerInfo>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PeerState {
    Fresh,
    InFlight,
    Ok,
    Failed,
}

struct QueryPeer {
    info: PeerInfo,
    distance: KadKey,
    state: PeerState,
}

enum RpcReply {
    Nodes(Vec<PeerInfo>),
    Value(Option<Record>, Vec<PeerInfo>),
    Providers(Vec<PeerInfo>, Vec<PeerInfo>),
}

#[derive(Default)]
struct PathResult {
    /// Peers that answered, with their distance to the target.
    ok_peers: Vec<(PeerInfo, KadKey)>,
    /// Records seen, each with the peer that served it.
    records: Vec<(Record, PeerId)>,
    providers: Vec<PeerInfo>,
    /// The wave budget ran out with fresh candidates left.
    exhausted: bool,
}

/// One iterative lookup, single-path or disjoint.
pub struct KadQuery {
    kind: QueryKind,
    target: KadKey,
    config: QueryConfig,
    security: SecurityConfig,
    validator: Option<Arc<dyn RecordValidator>>,
    initial: Vec<PeerInfo>,
}

impl KadQuery {
    pub fn new(kind: QueryKind, config: QueryConfig, initial: Vec<PeerInfo>) -> Self {
        let target = kind.target();
        Self {
            kind,
            target,
            config,
            security: SecurityConfig::default(),
            validator: None,
            initial,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn RecordValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    /// Runs the lookup to completion, bounded by the configured timeout.
    /// Timing out cancels every in-flight RPC.
    pub async fn run<D>(self, delegate: &D) -> Result<QueryOutcome>
    where
        D: QueryDelegate + ?Sized,
    {
        if self.initial.is_empty() {
            return Err(KadError::NoPeersAvailable);
        }
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.execute(delegate)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(KadError::Timeout(timeout)),
        }
    }

    async fn execute<D>(self, delegate: &D) -> Result<QueryOutcome>
    where
        D: QueryDelegate + ?Sized,
    {
        let mut seeds: Vec<(PeerInfo, KadKey)> = self
            .initial
            .iter()
            .map(|info| (info.clone(), KadKey::from_peer(&info.peer)))
            .collect();
        seeds.sort_by_key(|(_, key)| key.distance(&self.target));

        let claimed: Mutex<HashSet<PeerId>> = Mutex::new(HashSet::new());
        let paths = self.security.disjoint_paths.clamp(1, seeds.len().max(1));
        let has_validator = self.validator.is_some();

        let results = if paths <= 1 {
            vec![
                run_path(
                    &self.kind,
                    &self.target,
                    &self.config,
                    self.security.sibling_count,
                    has_validator,
                    delegate,
                    seeds.into_iter().map(|(info, _)| info).collect(),
                    &claimed,
                )
                .await,
            ]
        } else {
            // Round-robin partition of the distance-sorted seeds into
            // pairwise disjoint subsets.
            let mut subsets: Vec<Vec<PeerInfo>> = vec![Vec::new(); paths];
            for (index, (info, _)) in seeds.into_iter().enumerate() {
                subsets[index % paths].push(info);
            }
            let futures = subsets.into_iter().map(|subset| {
                run_path(
                    &self.kind,
                    &self.target,
                    &self.config,
                    self.security.sibling_count,
                    has_validator,
                    delegate,
                    subset,
                    &claimed,
                )
            });
            join_all(futures).await
        };

        self.finalize(results)
    }

    fn finalize(&self, paths: Vec<PathResult>) -> Result<QueryOutcome> {
        let exhausted = paths.iter().any(|p| p.exhausted);
        if exhausted {
            if self.config.strict_depth {
                return Err(KadError::MaxDepthExceeded);
            }
            warn!(
                lookup = %self.target,
                "lookup exhausted its wave budget; returning the best-effort nearest set"
            );
        }

        let closest = closest_ok_peers(&paths, &self.target, self.config.k);

        match &self.kind {
            QueryKind::FindNode(_) => Ok(QueryOutcome::Nodes(closest)),
            QueryKind::GetValue(key) => {
                let records: Vec<(Record, PeerId)> = paths
                    .into_iter()
                    .flat_map(|p| p.records)
                    .collect();
                if records.is_empty() {
                    return Ok(QueryOutcome::Value {
                        record: None,
                        from: None,
                        closest,
                    });
                }
                let candidates: Vec<Record> =
                    records.iter().map(|(record, _)| record.clone()).collect();
                let index = self
                    .validator
                    .as_ref()
                    .map(|v| v.select(key, &candidates))
                    .unwrap_or(0);
                let (record, from) = records
                    .get(index)
                    .or_else(|| records.first())
                    .cloned()
                    .ok_or_else(|| KadError::QueryFailed("record selection came up empty".into()))?;
                Ok(QueryOutcome::Value {
                    record: Some(record),
                    from: Some(from),
                    closest,
                })
            }
            QueryKind::GetProviders(_) => {
                let mut seen = HashSet::new();
                let providers = paths
                    .into_iter()
                    .flat_map(|p| p.providers)
                    .filter(|info| seen.insert(info.peer.clone()))
                    .collect();
                Ok(QueryOutcome::Providers { providers, closest })
            }
        }
    }
}

fn closest_ok_peers(paths: &[PathResult], target: &KadKey, k: usize) -> Vec<PeerInfo> {
    let mut seen = HashSet::new();
    let mut peers: Vec<&(PeerInfo, KadKey)> = paths
        .iter()
        .flat_map(|p| p.ok_peers.iter())
        .filter(|(info, _)| seen.insert(info.peer.clone()))
        .collect();
    peers.sort_by_key(|(_, key)| key.distance(target));
    peers
        .into_iter()
        .take(k)
        .map(|(info, _)| info.clone())
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn run_path<D>(
    kind: &QueryKind,
    target: &KadKey,
    config: &QueryConfig,
    sibling_count: usize,
    has_validator: bool,
    delegate: &D,
    seeds: Vec<PeerInfo>,
    claimed: &Mutex<HashSet<PeerId>>,
) -> PathResult
where
    D: QueryDelegate + ?Sized,
{
    let mut peers: HashMap<PeerId, QueryPeer> = HashMap::new();
    for info in seeds {
        if claimed.lock().insert(info.peer.clone()) {
            let distance = KadKey::from_peer(&info.peer).distance(target);
            peers.insert(
                info.peer.clone(),
                QueryPeer {
                    info,
                    distance,
                    state: PeerState::Fresh,
                },
            );
        }
    }

    let mut result = PathResult::default();
    let mut provider_ids: HashSet<PeerId> = HashSet::new();

    for _wave in 0..config.max_iterations {
        let wave = select_wave(&peers, config.alpha, sibling_count);
        if wave.is_empty() {
            return result;
        }

        let futures: Vec<_> = wave
            .iter()
            .map(|id| {
                let peer = peers
                    .get_mut(id)
                    .map(|p| {
                        p.state = PeerState::InFlight;
                        p.info.clone()
                    });
                let id = id.clone();
                async move {
                    match peer {
                        Some(info) => {
                            let reply = dispatch(delegate, kind, target, &info).await;
                            (id, Some(info), reply)
                        }
                        None => (id, None, Err(KadError::QueryFailed("peer vanished".into()))),
                    }
                }
            })
            .collect();

        // One wave settles in full before the next is selected.
        for (id, info, reply) in join_all(futures).await {
            match reply {
                Ok(reply) => {
                    if let Some(peer) = peers.get_mut(&id) {
                        peer.state = PeerState::Ok;
                    }
                    if let Some(info) = info {
                        let distance = KadKey::from_peer(&info.peer).distance(target);
                        result.ok_peers.push((info, distance));
                    }
                    fold_reply(
                        reply,
                        &id,
                        target,
                        &mut peers,
                        claimed,
                        &mut result,
                        &mut provider_ids,
                    );
                }
                Err(err) => {
                    debug!(peer = %id, %err, "lookup RPC failed");
                    if let Some(peer) = peers.get_mut(&id) {
                        peer.state = PeerState::Failed;
                    }
                }
            }
        }

        // Legacy first-wins: without a validator the first record ends the
        // path as soon as its wave has settled.
        if !has_validator && !result.records.is_empty() {
            return result;
        }
    }

    result.exhausted = peers.values().any(|p| p.state == PeerState::Fresh);
    result
}

fn fold_reply(
    reply: RpcReply,
    from: &PeerId,
    target: &KadKey,
    peers: &mut HashMap<PeerId, QueryPeer>,
    claimed: &Mutex<HashSet<PeerId>>,
    result: &mut PathResult,
    provider_ids: &mut HashSet<PeerId>,
) {
    let mut absorb_closer = |closer: Vec<PeerInfo>, peers: &mut HashMap<PeerId, QueryPeer>| {
        for info in closer {
            if peers.contains_key(&info.peer) {
                continue;
            }
            if !claimed.lock().insert(info.peer.clone()) {
                continue;
            }
            let distance = KadKey::from_peer(&info.peer).distance(target);
            peers.insert(
                info.peer.clone(),
                QueryPeer {
                    info,
                    distance,
                    state: PeerState::Fresh,
                },
            );
        }
    };

    match reply {
        RpcReply::Nodes(closer) => absorb_closer(closer, peers),
        RpcReply::Value(record, closer) => {
            if let Some(record) = record {
                result.records.push((record, from.clone()));
            }
            absorb_closer(closer, peers);
        }
        RpcReply::Providers(providers, closer) => {
            for info in providers {
                if provider_ids.insert(info.peer.clone()) {
                    result.providers.push(info);
                }
            }
            absorb_closer(closer, peers);
        }
    }
}

/// Picks the wave: the `alpha` closest fresh candidates, plus up to
/// `sibling_count` fresh peers drawn round-robin from bucket strata other
/// than those already represented.
fn select_wave(
    peers: &HashMap<PeerId, QueryPeer>,
    alpha: usize,
    sibling_count: usize,
) -> Vec<PeerId> {
    let mut fresh: Vec<&QueryPeer> = peers
        .values()
        .filter(|p| p.state == PeerState::Fresh)
        .collect();
    fresh.sort_by_key(|p| p.distance);

    let mut wave: Vec<PeerId> = fresh
        .iter()
        .take(alpha)
        .map(|p| p.info.peer.clone())
        .collect();

    if sibling_count == 0 || fresh.len() <= alpha {
        return wave;
    }

    let base_strata: HashSet<usize> = fresh
        .iter()
        .take(alpha)
        .map(|p| p.distance.bucket_index().unwrap_or(0))
        .collect();

    let mut strata: BTreeMap<usize, VecDeque<&QueryPeer>> = BTreeMap::new();
    for peer in fresh.iter().skip(alpha) {
        let stratum = peer.distance.bucket_index().unwrap_or(0);
        if !base_strata.contains(&stratum) {
            strata.entry(stratum).or_default().push_back(peer);
        }
    }

    let mut taken = 0;
    while taken < sibling_count && strata.values().any(|q| !q.is_empty()) {
        for queue in strata.values_mut() {
            if taken >= sibling_count {
                break;
            }
            if let Some(peer) = queue.pop_front() {
                wave.push(peer.info.peer.clone());
                taken += 1;
            }
        }
    }
    wave
}

async fn dispatch<D>(
    delegate: &D,
    kind: &QueryKind,
    target: &KadKey,
    peer: &PeerInfo,
) -> Result<RpcReply>
where
    D: QueryDelegate + ?Sized,
{
    match kind {
        QueryKind::FindNode(_) => delegate
            .send_find_node(peer, target)
            .await
            .map(RpcReply::Nodes),
        QueryKind::GetValue(key) => delegate
            .send_get_value(peer, key)
            .await
            .map(|(record, closer)| RpcReply::Value(record, closer)),
        QueryKind::GetProviders(key) => delegate
            .send_get_providers(peer, key)
            .await
            .map(|(providers, closer)| RpcReply::Providers(providers, closer)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{AcceptAllValidator, RecordValidator};

    fn peer(id: u8) -> PeerInfo {
        PeerInfo::new(PeerId::new(vec![id]), vec![])
    }

    /// Scripted delegate: every peer answers with a configured closer-peer
    /// list, record or provider set, and every contact is counted.
    #[derive(Default)]
    struct ScriptedDelegate {
        closer: HashMap<PeerId, Vec<PeerInfo>>,
        values: HashMap<PeerId, Record>,
        providers: HashMap<PeerId, Vec<PeerInfo>>,
        failing: HashSet<PeerId>,
        stall: HashSet<PeerId>,
        contacts: Mutex<Vec<PeerId>>,
    }

    impl ScriptedDelegate {
        fn contacts(&self) -> Vec<PeerId> {
            self.contacts.lock().clone()
        }

        async fn common(&self, peer: &PeerInfo) -> Result<Vec<PeerInfo>> {
            self.contacts.lock().push(peer.peer.clone());
            if self.stall.contains(&peer.peer) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing.contains(&peer.peer) {
                return Err(KadError::Io("connection refused".into()));
            }
            Ok(self.closer.get(&peer.peer).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl QueryDelegate for ScriptedDelegate {
        async fn send_find_node(&self, peer: &PeerInfo, _target: &KadKey) -> Result<Vec<PeerInfo>> {
            self.common(peer).await
        }

        async fn send_get_value(
            &self,
            peer: &PeerInfo,
            _key: &[u8],
        ) -> Result<(Option<Record>, Vec<PeerInfo>)> {
            let closer = self.common(peer).await?;
            Ok((self.values.get(&peer.peer).cloned(), closer))
        }

        async fn send_get_providers(
            &self,
            peer: &PeerInfo,
            _key: &[u8],
        ) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
            let closer = self.common(peer).await?;
            Ok((
                self.providers.get(&peer.peer).cloned().unwrap_or_default(),
                closer,
            ))
        }
    }

    fn config() -> QueryConfig {
        QueryConfig {
            timeout: Duration::from_secs(5),
            ..QueryConfig::default()
        }
    }

    #[tokio::test]
    async fn find_node_with_a_lone_seed() {
        let delegate = ScriptedDelegate::default();
        let query = KadQuery::new(
            QueryKind::FindNode(KadKey::from_hash(b"t")),
            config(),
            vec![peer(1)],
        );

        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Nodes(nodes) => {
                assert_eq!(nodes, vec![peer(1)]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(delegate.contacts(), vec![peer(1).peer]);
    }

    #[tokio::test]
    async fn lookup_follows_closer_peers() {
        let mut delegate = ScriptedDelegate::default();
        delegate.closer.insert(peer(1).peer, vec![peer(2), peer(3)]);
        delegate.closer.insert(peer(2).peer, vec![peer(4)]);

        let query = KadQuery::new(
            QueryKind::FindNode(KadKey::from_hash(b"t")),
            config(),
            vec![peer(1)],
        );
        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Nodes(nodes) => {
                assert_eq!(nodes.len(), 4);
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Everybody was contacted exactly once.
        let mut contacts = delegate.contacts();
        contacts.sort();
        contacts.dedup();
        assert_eq!(contacts.len(), 4);
        assert_eq!(delegate.contacts().len(), 4);
    }

    #[tokio::test]
    async fn get_value_returns_on_first_record_without_a_validator() {
        let mut delegate = ScriptedDelegate::default();
        delegate.closer.insert(peer(1).peer, vec![peer(2)]);
        delegate
            .values
            .insert(peer(2).peer, Record::new(b"k".to_vec(), b"v".to_vec()));

        let query = KadQuery::new(QueryKind::GetValue(b"k".to_vec()), config(), vec![peer(1)]);
        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Value { record, from, .. } => {
                assert_eq!(record, Some(Record::new(b"k".to_vec(), b"v".to_vec())));
                assert_eq!(from, Some(peer(2).peer));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_value_without_any_record_reports_the_closest_peers() {
        let mut delegate = ScriptedDelegate::default();
        delegate.closer.insert(peer(1).peer, vec![peer(2)]);

        let query = KadQuery::new(QueryKind::GetValue(b"k".to_vec()), config(), vec![peer(1)]);
        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Value {
                record, closest, ..
            } => {
                assert_eq!(record, None);
                assert_eq!(closest.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// With a validator every path runs to completion and the validator picks
    /// among all collected records.
    #[tokio::test]
    async fn validator_selection_sees_every_record() {
        struct PickLongest;
        impl RecordValidator for PickLongest {
            fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
                Ok(())
            }
            fn select(&self, _key: &[u8], records: &[Record]) -> usize {
                records
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, r)| r.value.len())
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            }
        }

        let mut delegate = ScriptedDelegate::default();
        delegate.closer.insert(peer(1).peer, vec![peer(2)]);
        delegate
            .values
            .insert(peer(1).peer, Record::new(b"k".to_vec(), b"short".to_vec()));
        delegate.values.insert(
            peer(2).peer,
            Record::new(b"k".to_vec(), b"much longer value".to_vec()),
        );

        let query = KadQuery::new(QueryKind::GetValue(b"k".to_vec()), config(), vec![peer(1)])
            .with_validator(Arc::new(PickLongest));
        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Value { record, from, .. } => {
                assert_eq!(record.unwrap().value, b"much longer value".to_vec());
                assert_eq!(from, Some(peer(2).peer));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn providers_are_deduplicated_across_replies() {
        let mut delegate = ScriptedDelegate::default();
        delegate.closer.insert(peer(1).peer, vec![peer(2)]);
        delegate
            .providers
            .insert(peer(1).peer, vec![peer(10), peer(11)]);
        delegate
            .providers
            .insert(peer(2).peer, vec![peer(10), peer(12)]);

        let query = KadQuery::new(
            QueryKind::GetProviders(b"content".to_vec()),
            config(),
            vec![peer(1)],
        );
        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Providers { providers, .. } => {
                let mut ids: Vec<_> = providers.iter().map(|p| p.peer.clone()).collect();
                ids.sort();
                assert_eq!(ids, vec![peer(10).peer, peer(11).peer, peer(12).peer]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failures_are_tolerated_and_terminal() {
        let mut delegate = ScriptedDelegate::default();
        delegate.closer.insert(peer(1).peer, vec![peer(2), peer(3)]);
        delegate.failing.insert(peer(2).peer);

        let query = KadQuery::new(
            QueryKind::FindNode(KadKey::from_hash(b"t")),
            config(),
            vec![peer(1)],
        );
        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Nodes(nodes) => {
                assert_eq!(nodes.len(), 2);
                assert!(!nodes.iter().any(|p| p.peer == peer(2).peer));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The failed peer is not retried.
        assert_eq!(
            delegate
                .contacts()
                .iter()
                .filter(|id| **id == peer(2).peer)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn empty_seed_set_is_refused() {
        let delegate = ScriptedDelegate::default();
        let query = KadQuery::new(
            QueryKind::FindNode(KadKey::from_hash(b"t")),
            config(),
            vec![],
        );
        assert!(matches!(
            query.run(&delegate).await,
            Err(KadError::NoPeersAvailable)
        ));
    }

    #[tokio::test]
    async fn stalled_peers_trip_the_overall_timeout() {
        let mut delegate = ScriptedDelegate::default();
        delegate.stall.insert(peer(1).peer);

        let query = KadQuery::new(
            QueryKind::FindNode(KadKey::from_hash(b"t")),
            QueryConfig {
                timeout: Duration::from_millis(50),
                ..QueryConfig::default()
            },
            vec![peer(1)],
        );
        assert!(matches!(
            query.run(&delegate).await,
            Err(KadError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn strict_depth_surfaces_exhaustion() {
        // An endless chain of fresh candidates with a budget of one wave.
        let mut delegate = ScriptedDelegate::default();
        delegate.closer.insert(peer(1).peer, vec![peer(2), peer(3)]);

        let query = KadQuery::new(
            QueryKind::FindNode(KadKey::from_hash(b"t")),
            QueryConfig {
                max_iterations: 1,
                strict_depth: true,
                timeout: Duration::from_secs(5),
                ..QueryConfig::default()
            },
            vec![peer(1)],
        );
        assert!(matches!(
            query.run(&delegate).await,
            Err(KadError::MaxDepthExceeded)
        ));
    }

    #[tokio::test]
    async fn disjoint_paths_never_share_a_peer() {
        let mut delegate = ScriptedDelegate::default();
        // Every seed advertises the same next hops; the claim set must keep
        // the paths disjoint anyway.
        let hops = vec![peer(10), peer(11), peer(12), peer(13)];
        for id in 1..=6u8 {
            delegate.closer.insert(peer(id).peer, hops.clone());
        }

        let query = KadQuery::new(
            QueryKind::FindNode(KadKey::from_hash(b"t")),
            config(),
            (1..=6).map(peer).collect(),
        )
        .with_security(SecurityConfig {
            disjoint_paths: 3,
            sibling_count: 0,
        });

        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Nodes(nodes) => assert!(!nodes.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }

        let contacts = delegate.contacts();
        let distinct: HashSet<_> = contacts.iter().cloned().collect();
        assert_eq!(contacts.len(), distinct.len(), "a peer was contacted twice");
    }

    #[tokio::test]
    async fn disjoint_get_value_merges_records_across_paths() {
        let mut delegate = ScriptedDelegate::default();
        delegate
            .values
            .insert(peer(1).peer, Record::new(b"k".to_vec(), b"a".to_vec()));
        delegate
            .values
            .insert(peer(2).peer, Record::new(b"k".to_vec(), b"bb".to_vec()));

        struct PickLongest;
        impl RecordValidator for PickLongest {
            fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
                Ok(())
            }
            fn select(&self, _key: &[u8], records: &[Record]) -> usize {
                records
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, r)| r.value.len())
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            }
        }

        let query = KadQuery::new(
            QueryKind::GetValue(b"k".to_vec()),
            config(),
            vec![peer(1), peer(2)],
        )
        .with_security(SecurityConfig {
            disjoint_paths: 2,
            sibling_count: 0,
        })
        .with_validator(Arc::new(PickLongest));

        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Value { record, .. } => {
                assert_eq!(record.unwrap().value, b"bb".to_vec());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sibling_broadcast_widens_the_wave() {
        let delegate = ScriptedDelegate::default();
        let seeds: Vec<PeerInfo> = (1..=30).map(peer).collect();

        let query = KadQuery::new(
            QueryKind::FindNode(KadKey::from_hash(b"t")),
            QueryConfig {
                alpha: 2,
                max_iterations: 1,
                timeout: Duration::from_secs(5),
                ..QueryConfig::default()
            },
            seeds,
        )
        .with_security(SecurityConfig {
            disjoint_paths: 1,
            sibling_count: 3,
        });

        let _ = query.run(&delegate).await.unwrap();
        // alpha plus up to sibling_count extras in the single wave.
        let contacted = delegate.contacts().len();
        assert!(contacted > 2, "sibling broadcast added nothing: {contacted}");
        assert!(contacted <= 5);
    }

    #[tokio::test]
    async fn default_get_value_is_first_wins_with_accept_all() {
        let mut delegate = ScriptedDelegate::default();
        delegate
            .values
            .insert(peer(1).peer, Record::new(b"k".to_vec(), b"v1".to_vec()));

        let query = KadQuery::new(QueryKind::GetValue(b"k".to_vec()), config(), vec![peer(1)])
            .with_validator(Arc::new(AcceptAllValidator));
        match query.run(&delegate).await.unwrap() {
            QueryOutcome::Value { record, .. } => {
                assert_eq!(record.unwrap().value, b"v1".to_vec());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
