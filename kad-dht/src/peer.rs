// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Peer identities and addresses.
//!
//! The DHT treats identities as opaque bytes. When an identity is derived
//! from a public key it is the SHA-256 of the key bytes, which is what the
//! IPNS validator relies on to tie a record key back to its signer.

use std::fmt;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Transport-agnostic peer identifier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    bytes: Vec<u8>,
}

impl PeerId {
    /// Wraps raw identity bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Copies an identity out of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Derives the identity of an ed25519 public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self {
            bytes: digest.to_vec(),
        }
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the id, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.bytes[..8.min(self.bytes.len())]))
    }
}

/// Transport-agnostic network address.
///
/// Abstracts away multiaddrs, socket addresses and friends; the transport is
/// the only layer that interprets these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub protocol: String,
    pub address: String,
}

impl PeerAddr {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
        }
    }

    /// Wire form: `protocol/address` as UTF-8 bytes.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        format!("{}/{}", self.protocol, self.address).into_bytes()
    }

    /// Parses the wire form; `None` for anything that is not
    /// `protocol/address` UTF-8.
    pub fn from_wire_bytes(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let (protocol, address) = text.split_once('/')?;
        if protocol.is_empty() || address.is_empty() {
            return None;
        }
        Some(Self::new(protocol, address))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.address)
    }
}

/// A peer together with the addresses it can purportedly be reached on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub addresses: Vec<PeerAddr>,
}

impl PeerInfo {
    pub fn new(peer: PeerId, addresses: Vec<PeerAddr>) -> Self {
        Self { peer, addresses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_identity_is_the_key_hash() {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let peer = PeerId::from_public_key(&signing.verifying_key());
        let expected = Sha256::digest(signing.verifying_key().as_bytes());
        assert_eq!(peer.as_bytes(), expected.as_slice());
        assert_eq!(peer.as_bytes().len(), 32);
    }

    #[test]
    fn addr_wire_round_trip() {
        let addr = PeerAddr::new("tcp", "127.0.0.1:4001");
        let parsed = PeerAddr::from_wire_bytes(&addr.to_wire_bytes());
        assert_eq!(parsed, Some(addr));
    }

    #[test]
    fn addr_wire_rejects_garbage() {
        assert_eq!(PeerAddr::from_wire_bytes(&[0xff, 0xfe]), None);
        assert_eq!(PeerAddr::from_wire_bytes(b"no-slash"), None);
        assert_eq!(PeerAddr::from_wire_bytes(b"/leading"), None);
    }
}
