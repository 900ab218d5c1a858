// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! IPNS records: signed name entries stored under `/ipns/<peerID>`.
//!
//! An entry binds a value to a peer identity with an end-of-life validity,
//! a monotonically increasing sequence number and an ed25519 signature over
//! `value ‖ validity_type_byte ‖ RFC3339(validity)`.

use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use prost::Message as _;

use crate::error::{KadError, Result};
use crate::peer::PeerId;
use crate::store::Record;
use crate::validator::RecordValidator;

/// Key prefix of the IPNS namespace.
pub const IPNS_PREFIX: &[u8] = b"/ipns/";

/// Wire form of an IPNS entry. Unknown fields are skipped on decode for
/// forward compatibility.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpnsEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
    #[prost(enumeration = "ValidityType", tag = "2")]
    pub validity_type: i32,
    #[prost(string, tag = "3")]
    pub validity: String,
    #[prost(uint64, tag = "4")]
    pub sequence: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub pub_key: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ValidityType {
    /// Absolute expiration time.
    Eol = 0,
}

impl IpnsEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::decode(bytes)?)
    }

    fn parsed_validity(&self) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.validity)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| KadError::InvalidRecord(format!("bad IPNS validity: {err}")))
    }
}

/// The DHT key an identity publishes its IPNS entry under.
pub fn ipns_key_for(peer: &PeerId) -> Vec<u8> {
    let mut key = IPNS_PREFIX.to_vec();
    key.extend_from_slice(peer.as_bytes());
    key
}

/// The material an IPNS signature covers.
fn signable(value: &[u8], validity_type: ValidityType, validity: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(value.len() + 1 + validity.len());
    data.extend_from_slice(value);
    data.push(validity_type as u8);
    data.extend_from_slice(validity.as_bytes());
    data
}

/// Builds and signs an entry with an end-of-life validity.
pub fn create_entry(
    key: &SigningKey,
    value: Vec<u8>,
    validity: DateTime<Utc>,
    sequence: u64,
) -> IpnsEntry {
    let validity = validity.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let signature = key.sign(&signable(&value, ValidityType::Eol, &validity));
    IpnsEntry {
        value,
        validity_type: ValidityType::Eol as i32,
        validity,
        sequence,
        signature: signature.to_bytes().to_vec(),
        pub_key: Some(key.verifying_key().as_bytes().to_vec()),
    }
}

/// Validates `/ipns/` records and selects between competing entries by
/// (sequence, validity, arrival order).
#[derive(Clone, Copy, Debug, Default)]
pub struct IpnsValidator;

impl IpnsValidator {
    fn verify(&self, key: &[u8], value: &[u8]) -> Result<IpnsEntry> {
        let entry = IpnsEntry::from_bytes(value)?;

        if entry.validity_type != ValidityType::Eol as i32 {
            return Err(KadError::InvalidRecord(format!(
                "unsupported IPNS validity type {}",
                entry.validity_type
            )));
        }
        if entry.parsed_validity()? <= Utc::now() {
            return Err(KadError::InvalidRecord("IPNS entry has expired".into()));
        }

        let peer_bytes = key.strip_prefix(IPNS_PREFIX).ok_or_else(|| {
            KadError::InvalidRecord("IPNS record key lacks the /ipns/ prefix".into())
        })?;
        let pub_key_bytes = entry
            .pub_key
            .as_deref()
            .ok_or_else(|| KadError::InvalidRecord("IPNS entry carries no public key".into()))?;
        let pub_key_arr: [u8; 32] = pub_key_bytes
            .try_into()
            .map_err(|_| KadError::InvalidRecord("malformed IPNS public key".into()))?;
        let pub_key = VerifyingKey::from_bytes(&pub_key_arr)
            .map_err(|err| KadError::InvalidRecord(format!("bad IPNS public key: {err}")))?;

        if PeerId::from_public_key(&pub_key).as_bytes() != peer_bytes {
            return Err(KadError::InvalidRecord(
                "IPNS public key does not match the record's peer identity".into(),
            ));
        }

        let signature = Signature::from_slice(&entry.signature)
            .map_err(|err| KadError::InvalidRecord(format!("malformed IPNS signature: {err}")))?;
        let material = signable(
            &entry.value,
            ValidityType::Eol,
            &entry.validity,
        );
        pub_key
            .verify_strict(&material, &signature)
            .map_err(|_| KadError::InvalidRecord("IPNS signature verification failed".into()))?;

        Ok(entry)
    }
}

impl RecordValidator for IpnsValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.verify(key, value).map(|_| ())
    }

    fn select(&self, _key: &[u8], records: &[Record]) -> usize {
        let mut best = 0usize;
        let mut best_rank: Option<(u64, DateTime<Utc>)> = None;
        for (index, record) in records.iter().enumerate() {
            let Ok(entry) = IpnsEntry::from_bytes(&record.value) else {
                continue;
            };
            let Ok(validity) = entry.parsed_validity() else {
                continue;
            };
            let rank = (entry.sequence, validity);
            let better = match &best_rank {
                None => true,
                Some(current) => rank > *current,
            };
            if better {
                best = index;
                best_rank = Some(rank);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn future() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::hours(24)
    }

    fn entry_for(seed: u8, value: &[u8], sequence: u64) -> (Vec<u8>, IpnsEntry) {
        let key = signing_key(seed);
        let peer = PeerId::from_public_key(&key.verifying_key());
        let entry = create_entry(&key, value.to_vec(), future(), sequence);
        (ipns_key_for(&peer), entry)
    }

    #[test]
    fn well_formed_entries_verify() {
        let (key, entry) = entry_for(1, b"/ipfs/QmTarget", 7);
        assert!(IpnsValidator.validate(&key, &entry.to_bytes()).is_ok());
    }

    #[test]
    fn expired_entries_fail() {
        let key = signing_key(1);
        let peer = PeerId::from_public_key(&key.verifying_key());
        let entry = create_entry(
            &key,
            b"v".to_vec(),
            Utc::now() - ChronoDuration::hours(1),
            0,
        );
        assert!(IpnsValidator
            .validate(&ipns_key_for(&peer), &entry.to_bytes())
            .is_err());
    }

    #[test]
    fn tampering_any_signed_field_breaks_verification() {
        let (key, entry) = entry_for(1, b"value", 3);

        let mut bad_value = entry.clone();
        bad_value.value[0] ^= 1;
        assert!(IpnsValidator.validate(&key, &bad_value.to_bytes()).is_err());

        let mut bad_sig = entry.clone();
        bad_sig.signature[10] ^= 1;
        assert!(IpnsValidator.validate(&key, &bad_sig.to_bytes()).is_err());

        let mut bad_validity = entry.clone();
        bad_validity.validity = (future() + ChronoDuration::hours(1))
            .to_rfc3339_opts(SecondsFormat::Nanos, true);
        assert!(IpnsValidator
            .validate(&key, &bad_validity.to_bytes())
            .is_err());
    }

    #[test]
    fn entries_under_a_foreign_identity_fail() {
        let (_, entry) = entry_for(1, b"value", 1);
        let other = PeerId::from_public_key(&signing_key(2).verifying_key());
        assert!(IpnsValidator
            .validate(&ipns_key_for(&other), &entry.to_bytes())
            .is_err());
    }

    #[test]
    fn missing_public_key_fails() {
        let (key, mut entry) = entry_for(1, b"value", 1);
        entry.pub_key = None;
        assert!(IpnsValidator.validate(&key, &entry.to_bytes()).is_err());
    }

    #[test]
    fn selection_prefers_sequence_then_validity_then_order() {
        let key = signing_key(1);
        let mk = |sequence, validity| {
            let entry = create_entry(&key, b"v".to_vec(), validity, sequence);
            Record::new(b"/ipns/x".to_vec(), entry.to_bytes())
        };

        let records = vec![mk(1, future()), mk(3, future()), mk(2, future())];
        assert_eq!(IpnsValidator.select(b"/ipns/x", &records), 1);

        let later = future() + ChronoDuration::hours(2);
        let records = vec![mk(5, future()), mk(5, later), mk(5, future())];
        assert_eq!(IpnsValidator.select(b"/ipns/x", &records), 1);

        let tie = future();
        let records = vec![mk(5, tie), mk(5, tie)];
        assert_eq!(IpnsValidator.select(b"/ipns/x", &records), 0);

        // Garbage never outranks parseable entries.
        let records = vec![
            Record::new(b"/ipns/x".to_vec(), b"garbage".to_vec()),
            mk(0, future()),
        ];
        assert_eq!(IpnsValidator.select(b"/ipns/x", &records), 1);
    }

    #[test]
    fn unknown_fields_are_skipped_on_decode() {
        let (_, entry) = entry_for(1, b"value", 1);
        let mut encoded = entry.to_bytes();
        prost::encoding::encode_varint((9 << 3) as u64, &mut encoded);
        prost::encoding::encode_varint(1234, &mut encoded);

        let decoded = IpnsEntry::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }
}
