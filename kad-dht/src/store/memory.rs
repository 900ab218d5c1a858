// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! In-memory store backends.
//!
//! Entries carry their expiry both as a monotonic instant (used for every
//! liveness check) and as wall-clock time, so the persistent backends can
//! snapshot state that survives a process restart.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;
use crate::store::{
    ProviderBackend, ProviderRecord, ProviderStoreConfig, Record, RecordBackend,
    RecordStoreConfig,
};

fn wall_to_unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Remaining lifetime of a persisted wall-clock deadline, or `None` if it has
/// already passed.
fn remaining_from_unix_ms(unix_ms: u64) -> Option<Duration> {
    let deadline = UNIX_EPOCH + Duration::from_millis(unix_ms);
    deadline.duration_since(SystemTime::now()).ok()
}

#[derive(Clone, Debug)]
struct StoredRecord {
    record: Record,
    expires_at: Instant,
    expires_wall: SystemTime,
}

impl StoredRecord {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Serialized form of one stored record; expiry is wall-clock because
/// monotonic clocks do not survive restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PersistedRecord {
    pub record: Record,
    pub expires_unix_ms: u64,
}

/// HashMap-backed record storage.
pub struct MemoryRecordBackend {
    config: RecordStoreConfig,
    records: HashMap<Vec<u8>, StoredRecord>,
}

impl MemoryRecordBackend {
    pub fn new(config: RecordStoreConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<PersistedRecord> {
        self.records
            .values()
            .filter(|stored| !stored.is_expired())
            .map(|stored| PersistedRecord {
                record: stored.record.clone(),
                expires_unix_ms: wall_to_unix_ms(stored.expires_wall),
            })
            .collect()
    }

    pub(crate) fn restore(config: RecordStoreConfig, persisted: Vec<PersistedRecord>) -> Self {
        let mut backend = Self::new(config);
        for entry in persisted {
            if let Some(remaining) = remaining_from_unix_ms(entry.expires_unix_ms) {
                backend.records.insert(
                    entry.record.key.clone(),
                    StoredRecord {
                        record: entry.record,
                        expires_at: Instant::now() + remaining,
                        expires_wall: UNIX_EPOCH + Duration::from_millis(entry.expires_unix_ms),
                    },
                );
            }
        }
        backend
    }
}

impl RecordBackend for MemoryRecordBackend {
    fn put(&mut self, record: Record, ttl: Duration) -> bool {
        if !self.records.contains_key(&record.key) && self.records.len() >= self.config.max_records
        {
            self.cleanup();
            if self.records.len() >= self.config.max_records {
                return false;
            }
        }
        self.records.insert(
            record.key.clone(),
            StoredRecord {
                record,
                expires_at: Instant::now() + ttl,
                expires_wall: SystemTime::now() + ttl,
            },
        );
        true
    }

    fn get(&mut self, key: &[u8]) -> Option<Record> {
        match self.records.get(key) {
            Some(stored) if !stored.is_expired() => Some(stored.record.clone()),
            Some(_) => {
                self.records.remove(key);
                None
            }
            None => None,
        }
    }

    fn remove(&mut self, key: &[u8]) -> Option<Record> {
        self.records.remove(key).map(|stored| stored.record)
    }

    fn all_records(&self) -> Vec<Record> {
        self.records
            .values()
            .filter(|stored| !stored.is_expired())
            .map(|stored| stored.record.clone())
            .collect()
    }

    fn cleanup(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, stored| !stored.is_expired());
        before - self.records.len()
    }

    fn remove_all(&mut self) {
        self.records.clear();
    }

    fn records_needing_republish(&self, threshold: Duration) -> Vec<Record> {
        let now = Instant::now();
        self.records
            .values()
            .filter(|stored| !stored.is_expired())
            .filter(
                |stored| match stored.expires_at.checked_sub(self.config.default_ttl) {
                    Some(put_at) => now.saturating_duration_since(put_at) > threshold,
                    None => true,
                },
            )
            .map(|stored| stored.record.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Clone, Debug)]
struct StoredProvider {
    provider: ProviderRecord,
    added_at: Instant,
    expires_at: Instant,
    added_wall: SystemTime,
    expires_wall: SystemTime,
}

impl StoredProvider {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Serialized form of one provider registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PersistedProvider {
    pub key: Vec<u8>,
    pub provider: ProviderRecord,
    pub added_unix_ms: u64,
    pub expires_unix_ms: u64,
}

/// HashMap-backed provider storage.
pub struct MemoryProviderBackend {
    config: ProviderStoreConfig,
    keys: HashMap<Vec<u8>, Vec<StoredProvider>>,
}

impl MemoryProviderBackend {
    pub fn new(config: ProviderStoreConfig) -> Self {
        Self {
            config,
            keys: HashMap::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<PersistedProvider> {
        self.keys
            .iter()
            .flat_map(|(key, providers)| {
                providers
                    .iter()
                    .filter(|stored| !stored.is_expired())
                    .map(|stored| PersistedProvider {
                        key: key.clone(),
                        provider: stored.provider.clone(),
                        added_unix_ms: wall_to_unix_ms(stored.added_wall),
                        expires_unix_ms: wall_to_unix_ms(stored.expires_wall),
                    })
            })
            .collect()
    }

    pub(crate) fn restore(config: ProviderStoreConfig, persisted: Vec<PersistedProvider>) -> Self {
        let mut backend = Self::new(config);
        let now_mono = Instant::now();
        let now_wall = SystemTime::now();
        for entry in persisted {
            let Some(remaining) = remaining_from_unix_ms(entry.expires_unix_ms) else {
                continue;
            };
            let added_wall = UNIX_EPOCH + Duration::from_millis(entry.added_unix_ms);
            let age = now_wall
                .duration_since(added_wall)
                .unwrap_or(Duration::ZERO);
            backend
                .keys
                .entry(entry.key)
                .or_default()
                .push(StoredProvider {
                    provider: entry.provider,
                    added_at: now_mono.checked_sub(age).unwrap_or(now_mono),
                    expires_at: now_mono + remaining,
                    added_wall,
                    expires_wall: UNIX_EPOCH + Duration::from_millis(entry.expires_unix_ms),
                });
        }
        backend
    }
}

impl ProviderBackend for MemoryProviderBackend {
    fn add(&mut self, key: &[u8], provider: ProviderRecord, ttl: Duration) -> bool {
        let is_new_key = !self.keys.contains_key(key);
        if is_new_key && self.keys.len() >= self.config.max_keys {
            self.cleanup();
            if self.keys.len() >= self.config.max_keys {
                return false;
            }
        }

        let providers = self.keys.entry(key.to_vec()).or_default();
        let stored = StoredProvider {
            provider,
            added_at: Instant::now(),
            expires_at: Instant::now() + ttl,
            added_wall: SystemTime::now(),
            expires_wall: SystemTime::now() + ttl,
        };

        if let Some(existing) = providers
            .iter_mut()
            .find(|p| p.provider.provider == stored.provider.provider)
        {
            *existing = stored;
            return true;
        }

        if providers.len() >= self.config.max_providers_per_key {
            providers.retain(|p| !p.is_expired());
            if providers.len() >= self.config.max_providers_per_key {
                return false;
            }
        }
        providers.push(stored);
        true
    }

    fn providers(&mut self, key: &[u8]) -> Vec<ProviderRecord> {
        let Some(providers) = self.keys.get_mut(key) else {
            return Vec::new();
        };
        providers.retain(|p| !p.is_expired());
        let result = providers.iter().map(|p| p.provider.clone()).collect();
        if providers.is_empty() {
            self.keys.remove(key);
        }
        result
    }

    fn remove(&mut self, key: &[u8], provider: &PeerId) -> bool {
        let Some(providers) = self.keys.get_mut(key) else {
            return false;
        };
        let before = providers.len();
        providers.retain(|p| p.provider.provider != *provider);
        let removed = providers.len() < before;
        if providers.is_empty() {
            self.keys.remove(key);
        }
        removed
    }

    fn clear_key(&mut self, key: &[u8]) {
        self.keys.remove(key);
    }

    fn cleanup(&mut self) -> usize {
        let mut removed = 0;
        self.keys.retain(|_, providers| {
            let before = providers.len();
            providers.retain(|p| !p.is_expired());
            removed += before - providers.len();
            !providers.is_empty()
        });
        removed
    }

    fn remove_all(&mut self) {
        self.keys.clear();
    }

    fn keys_needing_republish(&self, local: &PeerId, threshold: Duration) -> Vec<Vec<u8>> {
        self.keys
            .iter()
            .filter(|(_, providers)| {
                providers.iter().any(|p| {
                    p.provider.provider == *local
                        && !p.is_expired()
                        && p.added_at.elapsed() > threshold
                })
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn key_count(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &[u8], value: &[u8]) -> Record {
        Record::new(key.to_vec(), value.to_vec())
    }

    fn provider(id: u8) -> ProviderRecord {
        ProviderRecord {
            provider: PeerId::new(vec![id]),
            addresses: vec![],
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn put_get_remove_round_trip() {
        let mut store = MemoryRecordBackend::new(RecordStoreConfig::default());
        assert!(store.put(record(b"k", b"v"), TTL));
        assert_eq!(store.get(b"k"), Some(record(b"k", b"v")));
        assert_eq!(store.remove(b"k"), Some(record(b"k", b"v")));
        assert_eq!(store.get(b"k"), None);
    }

    #[test]
    fn expired_records_are_invisible_without_cleanup() {
        let mut store = MemoryRecordBackend::new(RecordStoreConfig::default());
        assert!(store.put(record(b"k", b"v"), Duration::ZERO));
        assert_eq!(store.get(b"k"), None);
        // The opportunistic removal already reclaimed the entry.
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn full_store_reclaims_expired_entries_before_failing() {
        let config = RecordStoreConfig {
            max_records: 2,
            ..Default::default()
        };
        let mut store = MemoryRecordBackend::new(config);
        assert!(store.put(record(b"a", b"1"), Duration::ZERO));
        assert!(store.put(record(b"b", b"2"), TTL));

        // "a" is expired and reclaimable.
        assert!(store.put(record(b"c", b"3"), TTL));
        // Nothing left to reclaim now.
        assert!(!store.put(record(b"d", b"4"), TTL));
        // Overwriting an existing key always succeeds.
        assert!(store.put(record(b"b", b"2-bis"), TTL));
    }

    #[test]
    fn republish_threshold_derives_put_time_from_expiry() {
        let config = RecordStoreConfig {
            default_ttl: TTL,
            ..Default::default()
        };
        let mut store = MemoryRecordBackend::new(config);
        store.put(record(b"old", b"v"), TTL);

        assert_eq!(store.records_needing_republish(TTL).len(), 0);
        std::thread::sleep(Duration::from_millis(20));
        let due = store.records_needing_republish(Duration::from_millis(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, b"old");
    }

    #[test]
    fn record_persistence_round_trips_wall_clock_expiry() {
        let mut store = MemoryRecordBackend::new(RecordStoreConfig::default());
        store.put(record(b"live", b"v"), TTL);
        store.put(record(b"dead", b"v"), Duration::ZERO);

        let snapshot = store.snapshot();
        let restored_snapshot: Vec<PersistedRecord> =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();
        let mut restored =
            MemoryRecordBackend::restore(RecordStoreConfig::default(), restored_snapshot);

        assert_eq!(restored.get(b"live"), Some(record(b"live", b"v")));
        assert_eq!(restored.get(b"dead"), None);
    }

    #[test]
    fn provider_uniqueness_per_key_and_peer() {
        let mut store = MemoryProviderBackend::new(ProviderStoreConfig::default());
        assert!(store.add(b"k", provider(1), TTL));
        assert!(store.add(b"k", provider(1), TTL));
        assert!(store.add(b"k", provider(2), TTL));
        assert_eq!(store.providers(b"k").len(), 2);
    }

    #[test]
    fn provider_capacity_per_key() {
        let config = ProviderStoreConfig {
            max_providers_per_key: 2,
            ..Default::default()
        };
        let mut store = MemoryProviderBackend::new(config);
        assert!(store.add(b"k", provider(1), TTL));
        assert!(store.add(b"k", provider(2), TTL));
        assert!(!store.add(b"k", provider(3), TTL));
    }

    #[test]
    fn clear_key_removes_all_providers() {
        let mut store = MemoryProviderBackend::new(ProviderStoreConfig::default());
        store.add(b"k", provider(1), TTL);
        store.add(b"k", provider(2), TTL);
        store.clear_key(b"k");
        assert!(store.providers(b"k").is_empty());
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn keys_needing_republish_only_lists_live_local_registrations() {
        let local = PeerId::new(vec![9]);
        let mut store = MemoryProviderBackend::new(ProviderStoreConfig::default());
        store.add(
            b"ours",
            ProviderRecord {
                provider: local.clone(),
                addresses: vec![],
            },
            TTL,
        );
        store.add(b"theirs", provider(1), TTL);

        std::thread::sleep(Duration::from_millis(20));
        let due = store.keys_needing_republish(&local, Duration::from_millis(5));
        assert_eq!(due, vec![b"ours".to_vec()]);
        assert!(store
            .keys_needing_republish(&local, Duration::from_secs(60))
            .is_empty());
    }
}
