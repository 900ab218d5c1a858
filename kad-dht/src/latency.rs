// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-peer latency and reliability statistics.
//!
//! Feeds two consumers: per-peer RPC timeouts scale with a peer's observed
//! round-trip times, and the overall success rate drives dynamic lookup
//! parallelism.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::peer::PeerId;

/// Statistics kept per tracked peer.
#[derive(Clone, Debug)]
pub struct PeerLatencyStats {
    /// Sum of measured round-trip times. Failures contribute nothing here.
    pub sum: Duration,
    /// Number of measured round trips.
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_updated: Instant,
}

impl PeerLatencyStats {
    fn new() -> Self {
        Self {
            sum: Duration::ZERO,
            count: 0,
            successes: 0,
            failures: 0,
            last_updated: Instant::now(),
        }
    }

    /// Mean measured round-trip time, if any samples exist.
    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as u32)
        }
    }
}

/// Tracks RTT and success statistics for up to `max_peers` peers, evicting
/// the least recently updated entry on overflow.
pub struct PeerLatencyTracker {
    max_peers: usize,
    peers: Mutex<HashMap<PeerId, PeerLatencyStats>>,
}

impl PeerLatencyTracker {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, peer: &PeerId, rtt: Duration) {
        let mut peers = self.peers.lock();
        let stats = peers
            .entry(peer.clone())
            .or_insert_with(PeerLatencyStats::new);
        stats.sum += rtt;
        stats.count += 1;
        stats.successes += 1;
        stats.last_updated = Instant::now();
        Self::enforce_capacity(&mut peers, self.max_peers, peer);
    }

    pub fn record_failure(&self, peer: &PeerId) {
        let mut peers = self.peers.lock();
        let stats = peers
            .entry(peer.clone())
            .or_insert_with(PeerLatencyStats::new);
        stats.failures += 1;
        stats.last_updated = Instant::now();
        Self::enforce_capacity(&mut peers, self.max_peers, peer);
    }

    fn enforce_capacity(
        peers: &mut HashMap<PeerId, PeerLatencyStats>,
        max_peers: usize,
        just_touched: &PeerId,
    ) {
        while peers.len() > max_peers {
            let oldest = peers
                .iter()
                .filter(|(id, _)| *id != just_touched)
                .min_by_key(|(_, stats)| stats.last_updated)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    peers.remove(&id);
                }
                None => break,
            }
        }
    }

    /// A per-peer request timeout: three average round trips, clamped to
    /// `[1s, default]`. Peers without samples get the default, and the floor
    /// never exceeds it.
    pub fn suggested_timeout(&self, peer: &PeerId, default: Duration) -> Duration {
        let peers = self.peers.lock();
        match peers.get(peer).and_then(PeerLatencyStats::average) {
            Some(avg) => (avg * 3).clamp(Duration::from_secs(1).min(default), default),
            None => default,
        }
    }

    /// Success fraction across every tracked peer, or `None` before any
    /// attempt has been recorded.
    pub fn overall_success_rate(&self) -> Option<f64> {
        let peers = self.peers.lock();
        let (successes, attempts) = peers.values().fold((0u64, 0u64), |(s, a), stats| {
            (s + stats.successes, a + stats.successes + stats.failures)
        });
        if attempts == 0 {
            None
        } else {
            Some(successes as f64 / attempts as f64)
        }
    }

    /// Drops entries not updated within `older_than`; returns how many went.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|_, stats| stats.last_updated.elapsed() <= older_than);
        before - peers.len()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats_for(&self, peer: &PeerId) -> Option<PeerLatencyStats> {
        self.peers.lock().get(peer).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u8) -> PeerId {
        PeerId::new(vec![id])
    }

    #[test]
    fn success_folds_rtt_and_failure_does_not() {
        let tracker = PeerLatencyTracker::new(10);
        tracker.record_success(&peer(1), Duration::from_millis(100));
        tracker.record_success(&peer(1), Duration::from_millis(300));
        tracker.record_failure(&peer(1));

        let stats = tracker.stats_for(&peer(1)).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.sum, Duration::from_millis(400));
        assert_eq!(stats.average(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn suggested_timeout_scales_and_clamps() {
        let tracker = PeerLatencyTracker::new(10);
        let default = Duration::from_secs(10);

        // No samples: default.
        assert_eq!(tracker.suggested_timeout(&peer(1), default), default);

        // 3 x 2s average = 6s, within bounds.
        tracker.record_success(&peer(1), Duration::from_secs(2));
        assert_eq!(
            tracker.suggested_timeout(&peer(1), default),
            Duration::from_secs(6)
        );

        // Very fast peer clamps up to one second.
        tracker.record_success(&peer(2), Duration::from_millis(10));
        assert_eq!(
            tracker.suggested_timeout(&peer(2), default),
            Duration::from_secs(1)
        );

        // Very slow peer clamps down to the default.
        tracker.record_success(&peer(3), Duration::from_secs(30));
        assert_eq!(tracker.suggested_timeout(&peer(3), default), default);
    }

    #[test]
    fn overall_rate_aggregates_across_peers() {
        let tracker = PeerLatencyTracker::new(10);
        assert_eq!(tracker.overall_success_rate(), None);

        tracker.record_success(&peer(1), Duration::from_millis(50));
        tracker.record_success(&peer(2), Duration::from_millis(50));
        tracker.record_failure(&peer(3));
        tracker.record_failure(&peer(3));

        assert_eq!(tracker.overall_success_rate(), Some(0.5));
    }

    #[test]
    fn over_capacity_evicts_the_stalest_entry() {
        let tracker = PeerLatencyTracker::new(2);
        tracker.record_success(&peer(1), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(5));
        tracker.record_success(&peer(2), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(5));
        tracker.record_success(&peer(3), Duration::from_millis(10));

        assert_eq!(tracker.len(), 2);
        assert!(tracker.stats_for(&peer(1)).is_none());
        assert!(tracker.stats_for(&peer(3)).is_some());
    }

    #[test]
    fn cleanup_drops_stale_entries() {
        let tracker = PeerLatencyTracker::new(10);
        tracker.record_failure(&peer(1));
        std::thread::sleep(Duration::from_millis(20));
        tracker.record_failure(&peer(2));

        let removed = tracker.cleanup(Duration::from_millis(10));
        assert_eq!(removed, 1);
        assert!(tracker.stats_for(&peer(1)).is_none());
        assert!(tracker.stats_for(&peer(2)).is_some());
    }
}
