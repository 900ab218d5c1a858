// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! 256-bit identifiers and the XOR metric.
//!
//! Keys are stored as four big-endian u64 lanes so that distance comparison,
//! leading-zero counting and bucket classification all stay within a handful
//! of register operations.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::KadError;
use crate::peer::PeerId;

/// Number of bytes in a key.
pub const KEY_LEN: usize = 32;

/// A point in the 256-bit Kademlia key space.
///
/// Also used to represent distances: the XOR of two keys is itself a key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KadKey {
    lanes: [u64; 4],
}

impl KadKey {
    /// Builds a key from exactly 32 bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let mut lanes = [0u64; 4];
        for (i, lane) in lanes.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *lane = u64::from_be_bytes(chunk);
        }
        Self { lanes }
    }

    /// Builds a key from a byte slice, failing unless it is exactly 32 bytes.
    pub fn validating(bytes: &[u8]) -> Result<Self, KadError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KadError::InvalidKeyLength {
            actual: bytes.len(),
            expected: KEY_LEN,
        })?;
        Ok(Self::from_bytes(arr))
    }

    /// Derives a key as the SHA-256 of arbitrary data.
    pub fn from_hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest);
        Self::from_bytes(bytes)
    }

    /// Derives the routing key of a peer.
    pub fn from_peer(peer: &PeerId) -> Self {
        Self::from_hash(peer.as_bytes())
    }

    /// XOR distance to another key.
    pub fn distance(&self, other: &KadKey) -> KadKey {
        let mut lanes = [0u64; 4];
        for i in 0..4 {
            lanes[i] = self.lanes[i] ^ other.lanes[i];
        }
        KadKey { lanes }
    }

    /// Number of leading zero bits, in `0..=256`.
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for lane in &self.lanes {
            if *lane == 0 {
                zeros += 64;
            } else {
                zeros += lane.leading_zeros();
                break;
            }
        }
        zeros
    }

    /// Whether every bit is zero.
    pub fn is_zero(&self) -> bool {
        self.lanes == [0u64; 4]
    }

    /// Bucket index of this key interpreted as a distance: `255 - leading
    /// zeros`, or `None` for the zero distance.
    pub fn bucket_index(&self) -> Option<usize> {
        if self.is_zero() {
            None
        } else {
            Some(255 - self.leading_zeros() as usize)
        }
    }

    /// Whether `self` is strictly closer to `target` than `other` is.
    pub fn is_closer_to(&self, target: &KadKey, other: &KadKey) -> bool {
        self.distance(target) < other.distance(target)
    }

    /// The 32-byte big-endian representation.
    pub fn to_bytes(self) -> [u8; KEY_LEN] {
        let mut bytes = [0u8; KEY_LEN];
        for (i, lane) in self.lanes.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&lane.to_be_bytes());
        }
        bytes
    }
}

impl fmt::Display for KadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.to_bytes()[..8]))
    }
}

impl fmt::Debug for KadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KadKey({self})")
    }
}
