// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! JSON-file store backends.
//!
//! State lives in memory and is mirrored to a JSON snapshot after every
//! mutation. Expiry is persisted as wall-clock time and converted back to a
//! monotonic deadline on load; a snapshot that fails to write is logged and
//! otherwise ignored, keeping the store best-effort.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::peer::PeerId;
use crate::store::memory::{MemoryProviderBackend, MemoryRecordBackend};
use crate::store::{
    ProviderBackend, ProviderRecord, ProviderStoreConfig, Record, RecordBackend,
    RecordStoreConfig,
};

fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("discarding corrupt store snapshot {}: {err}", path.display());
                Vec::new()
            }
        },
        Err(err) => {
            debug!("no store snapshot at {}: {err}", path.display());
            Vec::new()
        }
    }
}

fn save_snapshot<T: Serialize>(path: &Path, entries: &[T]) {
    let result = serde_json::to_vec_pretty(entries)
        .map_err(|err| err.to_string())
        .and_then(|bytes| std::fs::write(path, bytes).map_err(|err| err.to_string()));
    if let Err(err) = result {
        warn!("failed to persist store snapshot {}: {err}", path.display());
    }
}

/// Record backend persisted as a JSON snapshot at a fixed path.
pub struct JsonRecordBackend {
    inner: MemoryRecordBackend,
    path: PathBuf,
}

impl JsonRecordBackend {
    pub fn new(path: PathBuf, config: RecordStoreConfig) -> Self {
        let persisted = load_snapshot(&path);
        Self {
            inner: MemoryRecordBackend::restore(config, persisted),
            path,
        }
    }

    fn persist(&self) {
        save_snapshot(&self.path, &self.inner.snapshot());
    }
}

impl RecordBackend for JsonRecordBackend {
    fn put(&mut self, record: Record, ttl: Duration) -> bool {
        let stored = self.inner.put(record, ttl);
        if stored {
            self.persist();
        }
        stored
    }

    fn get(&mut self, key: &[u8]) -> Option<Record> {
        self.inner.get(key)
    }

    fn remove(&mut self, key: &[u8]) -> Option<Record> {
        let removed = self.inner.remove(key);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    fn all_records(&self) -> Vec<Record> {
        self.inner.all_records()
    }

    fn cleanup(&mut self) -> usize {
        let removed = self.inner.cleanup();
        if removed > 0 {
            self.persist();
        }
        removed
    }

    fn remove_all(&mut self) {
        self.inner.remove_all();
        self.persist();
    }

    fn records_needing_republish(&self, threshold: Duration) -> Vec<Record> {
        self.inner.records_needing_republish(threshold)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Provider backend persisted as a JSON snapshot at a fixed path.
pub struct JsonProviderBackend {
    inner: MemoryProviderBackend,
    path: PathBuf,
}

impl JsonProviderBackend {
    pub fn new(path: PathBuf, config: ProviderStoreConfig) -> Self {
        let persisted = load_snapshot(&path);
        Self {
            inner: MemoryProviderBackend::restore(config, persisted),
            path,
        }
    }

    fn persist(&self) {
        save_snapshot(&self.path, &self.inner.snapshot());
    }
}

impl ProviderBackend for JsonProviderBackend {
    fn add(&mut self, key: &[u8], provider: ProviderRecord, ttl: Duration) -> bool {
        let added = self.inner.add(key, provider, ttl);
        if added {
            self.persist();
        }
        added
    }

    fn providers(&mut self, key: &[u8]) -> Vec<ProviderRecord> {
        self.inner.providers(key)
    }

    fn remove(&mut self, key: &[u8], provider: &PeerId) -> bool {
        let removed = self.inner.remove(key, provider);
        if removed {
            self.persist();
        }
        removed
    }

    fn clear_key(&mut self, key: &[u8]) {
        self.inner.clear_key(key);
        self.persist();
    }

    fn cleanup(&mut self) -> usize {
        let removed = self.inner.cleanup();
        if removed > 0 {
            self.persist();
        }
        removed
    }

    fn remove_all(&mut self) {
        self.inner.remove_all();
        self.persist();
    }

    fn keys_needing_republish(&self, local: &PeerId, threshold: Duration) -> Vec<Vec<u8>> {
        self.inner.keys_needing_republish(local, threshold)
    }

    fn key_count(&self) -> usize {
        self.inner.key_count()
    }
}
