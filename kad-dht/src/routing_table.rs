// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The routing table: 256 k-buckets indexed by XOR distance to the local key.

use parking_lot::Mutex;
use rand::Rng;

use crate::config::MAX_BUCKETS;
use crate::error::{KadError, Result};
use crate::kbucket::{InsertOutcome, KBucket, PeerEntry};
use crate::key::{KadKey, KEY_LEN};
use crate::peer::{PeerAddr, PeerId};
use std::time::Duration;

/// Shared routing state. All mutation happens under one internal mutex with
/// short critical sections; the lock is never held across I/O.
pub struct RoutingTable {
    local_peer: PeerId,
    local_key: KadKey,
    buckets: Mutex<Vec<KBucket>>,
}

impl RoutingTable {
    pub fn new(local_peer: PeerId, k: usize, pending_capacity: usize) -> Self {
        let local_key = KadKey::from_peer(&local_peer);
        let buckets = (0..MAX_BUCKETS)
            .map(|_| KBucket::new(k, pending_capacity))
            .collect();
        Self {
            local_peer,
            local_key,
            buckets: Mutex::new(buckets),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn local_key(&self) -> &KadKey {
        &self.local_key
    }

    /// Index of the bucket a peer key belongs to, or an error for the local
    /// peer and for foreign peers that collide with the local key.
    fn bucket_index_for(&self, peer: &PeerId, key: &KadKey) -> Result<usize> {
        if *peer == self.local_peer {
            return Err(KadError::SelfEntry);
        }
        self.local_key
            .distance(key)
            .bucket_index()
            .ok_or(KadError::SelfEntry)
    }

    /// Adds or refreshes a peer.
    pub fn add_peer(&self, peer: PeerId, addresses: Vec<PeerAddr>) -> Result<InsertOutcome> {
        let key = KadKey::from_peer(&peer);
        let index = self.bucket_index_for(&peer, &key)?;
        let mut buckets = self.buckets.lock();
        Ok(buckets[index].insert(peer, addresses))
    }

    pub fn remove_peer(&self, peer: &PeerId) -> Option<PeerEntry> {
        let key = KadKey::from_peer(peer);
        let index = self.bucket_index_for(peer, &key).ok()?;
        self.buckets.lock()[index].remove(peer)
    }

    pub fn entry(&self, peer: &PeerId) -> Option<PeerEntry> {
        let key = KadKey::from_peer(peer);
        let index = self.bucket_index_for(peer, &key).ok()?;
        self.buckets.lock()[index].get(peer).cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entry(peer).is_some()
    }

    /// Total number of live entries.
    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of per-bucket occupancy.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.lock().iter().map(KBucket::len).collect()
    }

    /// The `count` table entries closest to `target`, sorted by distance,
    /// never including anyone in `excluding`.
    ///
    /// Candidates are gathered from the bucket the target maps into and
    /// outward. Peers in buckets above the center are strictly farther than
    /// everything at or below it, so the upward sweep stops as soon as enough
    /// candidates are in hand; buckets below the center all share one
    /// distance band and are swept in full once any of them is needed.
    pub fn closest_peers(
        &self,
        target: &KadKey,
        count: usize,
        excluding: &[PeerId],
    ) -> Vec<PeerEntry> {
        if count == 0 {
            return Vec::new();
        }

        let center = self
            .local_key
            .distance(target)
            .bucket_index()
            .unwrap_or(MAX_BUCKETS - 1);

        let buckets = self.buckets.lock();
        let mut collected: Vec<PeerEntry> = Vec::new();
        let mut gather = |bucket: &KBucket, out: &mut Vec<PeerEntry>| {
            out.extend(
                bucket
                    .iter()
                    .filter(|e| !excluding.contains(&e.peer))
                    .cloned(),
            );
        };

        gather(&buckets[center], &mut collected);
        if collected.len() < count {
            for index in (0..center).rev() {
                gather(&buckets[index], &mut collected);
            }
        }
        for index in center + 1..MAX_BUCKETS {
            if collected.len() >= count {
                break;
            }
            gather(&buckets[index], &mut collected);
        }
        drop(buckets);

        collected.sort_by_key(|entry| entry.key.distance(target));
        collected.truncate(count);
        collected
    }

    /// Indices of non-empty buckets whose last refresh is older than
    /// `threshold`.
    pub fn buckets_needing_refresh(&self, threshold: Duration) -> Vec<usize> {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.last_refreshed().elapsed() > threshold)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_bucket_refreshed(&self, index: usize) {
        if index < MAX_BUCKETS {
            self.buckets.lock()[index].mark_refreshed();
        }
    }

    /// A uniformly random key whose distance from the local key lands exactly
    /// in bucket `index`: the distance gets `255 - index` leading zeros, a set
    /// bit, and random bits below.
    pub fn random_key_for_bucket(&self, index: usize) -> KadKey {
        debug_assert!(index < MAX_BUCKETS);
        let zeros = (MAX_BUCKETS - 1).saturating_sub(index);
        let byte_index = zeros / 8;
        let bit = (zeros % 8) as u8;

        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        for byte in bytes.iter_mut().take(byte_index) {
            *byte = 0;
        }
        let lower_mask = (0x80u8 >> bit).wrapping_sub(1);
        bytes[byte_index] = (bytes[byte_index] & lower_mask) | (0x80 >> bit);

        let distance = KadKey::from_bytes(bytes);
        self.local_key.distance(&distance)
    }
}
