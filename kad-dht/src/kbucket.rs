// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! K-buckets: bounded bags of peers at one distance stratum.
//!
//! Entries are kept least-recently-seen first; a small pending cache holds
//! overflow candidates until a live entry dies or is explicitly evicted.

use std::time::Instant;

use crate::key::KadKey;
use crate::peer::{PeerAddr, PeerId};

/// A peer as remembered by the routing table.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub peer: PeerId,
    /// Cached `KadKey::from_peer(peer)`.
    pub key: KadKey,
    /// Known addresses, deduplicated, in first-seen order.
    pub addresses: Vec<PeerAddr>,
    pub last_seen: Instant,
}

impl PeerEntry {
    pub fn new(peer: PeerId, addresses: Vec<PeerAddr>) -> Self {
        let key = KadKey::from_peer(&peer);
        let mut entry = Self {
            peer,
            key,
            addresses: Vec::new(),
            last_seen: Instant::now(),
        };
        entry.merge_addresses(addresses);
        entry
    }

    /// Folds in addresses not already known, preserving order.
    pub fn merge_addresses(&mut self, addresses: Vec<PeerAddr>) {
        for addr in addresses {
            if !self.addresses.contains(&addr) {
                self.addresses.push(addr);
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Outcome of inserting a peer into a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New live entry.
    Inserted,
    /// Existing entry touched and re-appended.
    Updated,
    /// Parked in (or refreshed within) the pending cache.
    Pending,
}

/// A single k-bucket: up to `k` live entries plus a pending cache.
#[derive(Clone, Debug)]
pub struct KBucket {
    k: usize,
    pending_capacity: usize,
    /// Live entries, last-seen ascending (oldest first).
    entries: Vec<PeerEntry>,
    /// Replacement candidates, oldest first.
    pending: Vec<PeerEntry>,
    last_refreshed: Instant,
}

impl KBucket {
    pub fn new(k: usize, pending_capacity: usize) -> Self {
        Self {
            k,
            pending_capacity,
            entries: Vec::new(),
            pending: Vec::new(),
            last_refreshed: Instant::now(),
        }
    }

    /// Inserts or refreshes a peer.
    pub fn insert(&mut self, peer: PeerId, addresses: Vec<PeerAddr>) -> InsertOutcome {
        if let Some(pos) = self.entries.iter().position(|e| e.peer == peer) {
            let mut entry = self.entries.remove(pos);
            entry.touch();
            entry.merge_addresses(addresses);
            self.entries.push(entry);
            self.last_refreshed = Instant::now();
            return InsertOutcome::Updated;
        }

        if let Some(pos) = self.pending.iter().position(|e| e.peer == peer) {
            let mut entry = self.pending.remove(pos);
            entry.touch();
            entry.merge_addresses(addresses);
            self.pending.push(entry);
            self.last_refreshed = Instant::now();
            return InsertOutcome::Pending;
        }

        if self.entries.len() < self.k {
            self.entries.push(PeerEntry::new(peer, addresses));
            self.last_refreshed = Instant::now();
            return InsertOutcome::Inserted;
        }

        if self.pending.len() >= self.pending_capacity {
            self.pending.remove(0);
        }
        self.pending.push(PeerEntry::new(peer, addresses));
        self.last_refreshed = Instant::now();
        InsertOutcome::Pending
    }

    /// Removes a peer, promoting the oldest pending candidate into a freed
    /// live slot.
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerEntry> {
        if let Some(pos) = self.entries.iter().position(|e| e.peer == *peer) {
            let removed = self.entries.remove(pos);
            if !self.pending.is_empty() {
                let promoted = self.pending.remove(0);
                self.entries.push(promoted);
            }
            return Some(removed);
        }

        self.pending
            .iter()
            .position(|e| e.peer == *peer)
            .map(|pos| self.pending.remove(pos))
    }

    /// Drops the least-recently-seen live entry in favour of a pending
    /// candidate. Only meaningful when the bucket is full and a candidate is
    /// waiting; returns the evicted peer.
    pub fn evict_oldest(&mut self) -> Option<PeerEntry> {
        if self.entries.len() < self.k || self.pending.is_empty() {
            return None;
        }
        let evicted = self.entries.remove(0);
        let promoted = self.pending.remove(0);
        self.entries.push(promoted);
        Some(evicted)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.entries.iter().find(|e| e.peer == *peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.iter().any(|e| e.peer == *peer)
    }

    /// Live entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.k
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_refreshed(&self) -> Instant {
        self.last_refreshed
    }

    pub fn mark_refreshed(&mut self) {
        self.last_refreshed = Instant::now();
    }
}
