// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Record and provider storage.
//!
//! The service talks to thin facades ([`RecordStore`], [`ProviderStore`])
//! that guard a pluggable backend with a mutex. Backends are best-effort:
//! storage trouble surfaces as `false`/empty rather than errors, so callers
//! needing strict semantics must hold the backend directly.

mod memory;
mod persistent;

pub use memory::{MemoryProviderBackend, MemoryRecordBackend};
pub use persistent::{JsonProviderBackend, JsonRecordBackend};

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::peer::{PeerAddr, PeerId};

/// A value stored in the DHT under an opaque key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// When the storing node first received the record, if known.
    pub time_received: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            time_received: None,
        }
    }

    pub fn with_time_received(mut self, time: DateTime<Utc>) -> Self {
        self.time_received = Some(time);
        self
    }
}

/// A peer registered as providing some content key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub provider: PeerId,
    pub addresses: Vec<PeerAddr>,
}

/// Capacity and TTL limits for a record backend.
#[derive(Clone, Copy, Debug)]
pub struct RecordStoreConfig {
    pub max_records: usize,
    /// Reference TTL used to recover a record's put time from its expiry.
    pub default_ttl: Duration,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            max_records: 1024,
            default_ttl: Duration::from_secs(36 * 60 * 60),
        }
    }
}

/// Capacity and TTL limits for a provider backend.
#[derive(Clone, Copy, Debug)]
pub struct ProviderStoreConfig {
    pub max_keys: usize,
    pub max_providers_per_key: usize,
    pub default_ttl: Duration,
}

impl Default for ProviderStoreConfig {
    fn default() -> Self {
        Self {
            max_keys: 1024,
            max_providers_per_key: 20,
            default_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Pluggable storage for records.
pub trait RecordBackend: Send {
    /// Stores or overwrites a record with `expiry = now + ttl`. Returns
    /// `false` when the store is full and nothing expired could be reclaimed.
    fn put(&mut self, record: Record, ttl: Duration) -> bool;

    /// Returns the record unless it has expired. May opportunistically drop
    /// an expired entry it trips over.
    fn get(&mut self, key: &[u8]) -> Option<Record>;

    fn remove(&mut self, key: &[u8]) -> Option<Record>;

    fn all_records(&self) -> Vec<Record>;

    /// Drops every expired entry, returning how many were removed.
    fn cleanup(&mut self) -> usize;

    fn remove_all(&mut self);

    /// Records whose put time (`expiry - default_ttl`) is older than
    /// `threshold`.
    fn records_needing_republish(&self, threshold: Duration) -> Vec<Record>;

    fn len(&self) -> usize;
}

/// Pluggable storage for provider registrations.
pub trait ProviderBackend: Send {
    /// Registers (or refreshes) a provider for a content key. Returns `false`
    /// when capacity is exhausted.
    fn add(&mut self, key: &[u8], provider: ProviderRecord, ttl: Duration) -> bool;

    /// Unexpired providers for a key.
    fn providers(&mut self, key: &[u8]) -> Vec<ProviderRecord>;

    fn remove(&mut self, key: &[u8], provider: &PeerId) -> bool;

    /// Drops every provider registered for a key.
    fn clear_key(&mut self, key: &[u8]);

    fn cleanup(&mut self) -> usize;

    fn remove_all(&mut self);

    /// Content keys the local node still provides (unexpired) whose
    /// registration is older than `threshold`.
    fn keys_needing_republish(&self, local: &PeerId, threshold: Duration) -> Vec<Vec<u8>>;

    fn key_count(&self) -> usize;
}

/// Mutex-guarded facade over a [`RecordBackend`].
pub struct RecordStore {
    backend: Mutex<Box<dyn RecordBackend>>,
}

impl RecordStore {
    pub fn new(backend: Box<dyn RecordBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    pub fn put(&self, record: Record, ttl: Duration) -> bool {
        self.backend.lock().put(record, ttl)
    }

    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.backend.lock().get(key)
    }

    pub fn remove(&self, key: &[u8]) -> Option<Record> {
        self.backend.lock().remove(key)
    }

    pub fn all_records(&self) -> Vec<Record> {
        self.backend.lock().all_records()
    }

    pub fn cleanup(&self) -> usize {
        self.backend.lock().cleanup()
    }

    pub fn remove_all(&self) {
        self.backend.lock().remove_all()
    }

    pub fn records_needing_republish(&self, threshold: Duration) -> Vec<Record> {
        self.backend.lock().records_needing_republish(threshold)
    }

    pub fn len(&self) -> usize {
        self.backend.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutex-guarded facade over a [`ProviderBackend`].
pub struct ProviderStore {
    backend: Mutex<Box<dyn ProviderBackend>>,
}

impl ProviderStore {
    pub fn new(backend: Box<dyn ProviderBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    pub fn add(&self, key: &[u8], provider: ProviderRecord, ttl: Duration) -> bool {
        self.backend.lock().add(key, provider, ttl)
    }

    pub fn providers(&self, key: &[u8]) -> Vec<ProviderRecord> {
        self.backend.lock().providers(key)
    }

    pub fn remove(&self, key: &[u8], provider: &PeerId) -> bool {
        self.backend.lock().remove(key, provider)
    }

    pub fn clear_key(&self, key: &[u8]) {
        self.backend.lock().clear_key(key)
    }

    pub fn cleanup(&self) -> usize {
        self.backend.lock().cleanup()
    }

    pub fn remove_all(&self) {
        self.backend.lock().remove_all()
    }

    pub fn keys_needing_republish(&self, local: &PeerId, threshold: Duration) -> Vec<Vec<u8>> {
        self.backend.lock().keys_needing_republish(local, threshold)
    }

    pub fn key_count(&self) -> usize {
        self.backend.lock().key_count()
    }
}
