// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Record validation and selection.
//!
//! Validators are capabilities with two duties: deciding whether a record may
//! be stored, and picking the best of several records found for one key. The
//! default selection keeps legacy first-wins behaviour.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use prost::Message as _;
use sha2::{Digest, Sha256};

use crate::error::{KadError, Result};
use crate::store::Record;

/// Validates and ranks records.
pub trait RecordValidator: Send + Sync {
    /// Whether a record may be stored under `key`.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Index of the best record among candidates stored under equal keys.
    /// The default preserves first-wins behaviour.
    fn select(&self, _key: &[u8], _records: &[Record]) -> usize {
        0
    }
}

/// Accepts everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllValidator;

impl RecordValidator for AcceptAllValidator {
    fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Rejects everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectAllValidator;

impl RecordValidator for RejectAllValidator {
    fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(KadError::InvalidRecord("record rejected by policy".into()))
    }
}

/// Bounds the key length.
#[derive(Clone, Copy, Debug)]
pub struct KeyLengthValidator {
    pub max_len: usize,
}

impl RecordValidator for KeyLengthValidator {
    fn validate(&self, key: &[u8], _value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(KadError::InvalidRecord("empty record key".into()));
        }
        if key.len() > self.max_len {
            return Err(KadError::InvalidRecord(format!(
                "record key of {} bytes exceeds limit of {}",
                key.len(),
                self.max_len
            )));
        }
        Ok(())
    }
}

/// Bounds the value size.
#[derive(Clone, Copy, Debug)]
pub struct ValueSizeValidator {
    pub max_bytes: usize,
}

impl RecordValidator for ValueSizeValidator {
    fn validate(&self, _key: &[u8], value: &[u8]) -> Result<()> {
        if value.len() > self.max_bytes {
            return Err(KadError::InvalidRecord(format!(
                "record value of {} bytes exceeds limit of {}",
                value.len(),
                self.max_bytes
            )));
        }
        Ok(())
    }
}

/// AND-fold over several validators; the first selects.
pub struct CompositeValidator {
    validators: Vec<Arc<dyn RecordValidator>>,
}

impl CompositeValidator {
    pub fn new(validators: Vec<Arc<dyn RecordValidator>>) -> Self {
        Self { validators }
    }
}

impl RecordValidator for CompositeValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        for validator in &self.validators {
            validator.validate(key, value)?;
        }
        Ok(())
    }

    fn select(&self, key: &[u8], records: &[Record]) -> usize {
        self.validators
            .first()
            .map(|v| v.select(key, records))
            .unwrap_or(0)
    }
}

/// Fallback behaviour of a [`NamespacedValidator`] for unknown namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceFallback {
    Accept,
    Reject,
}

/// Dispatches on the `/<ns>/` key prefix.
///
/// The namespace is the byte prefix up to and including the second slash;
/// keys without one fall through to the configured fallback.
pub struct NamespacedValidator {
    validators: HashMap<String, Arc<dyn RecordValidator>>,
    fallback: NamespaceFallback,
}

impl NamespacedValidator {
    pub fn new(fallback: NamespaceFallback) -> Self {
        Self {
            validators: HashMap::new(),
            fallback,
        }
    }

    /// Registers a validator for namespace `ns` (without slashes).
    pub fn with_namespace(mut self, ns: &str, validator: Arc<dyn RecordValidator>) -> Self {
        self.validators.insert(format!("/{ns}/"), validator);
        self
    }

    fn lookup(&self, key: &[u8]) -> Option<&Arc<dyn RecordValidator>> {
        let prefix = namespace_prefix(key)?;
        self.validators.get(std::str::from_utf8(prefix).ok()?)
    }
}

/// The `/<ns>/` prefix of a key, including both slashes.
pub fn namespace_prefix(key: &[u8]) -> Option<&[u8]> {
    if key.first() != Some(&b'/') {
        return None;
    }
    let second = key[1..].iter().position(|b| *b == b'/')?;
    Some(&key[..second + 2])
}

impl RecordValidator for NamespacedValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.lookup(key) {
            Some(validator) => validator.validate(key, value),
            None => match self.fallback {
                NamespaceFallback::Accept => Ok(()),
                NamespaceFallback::Reject => Err(KadError::InvalidRecord(
                    "record key in unknown namespace".into(),
                )),
            },
        }
    }

    fn select(&self, key: &[u8], records: &[Record]) -> usize {
        match self.lookup(key) {
            Some(validator) => validator.select(key, records),
            None => 0,
        }
    }
}

/// A self-certifying value: payload bytes bound to the ed25519 key that
/// signed them.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedEnvelope {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub pub_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
}

/// Wraps and signs a payload for storage under a signed-envelope namespace.
pub fn seal_envelope(key: &SigningKey, payload: Vec<u8>) -> SignedEnvelope {
    let signature = key.sign(&payload);
    SignedEnvelope {
        pub_key: key.verifying_key().as_bytes().to_vec(),
        signature: signature.to_bytes().to_vec(),
        payload,
    }
}

/// Accepts only values that are envelopes with a valid signature.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignedEnvelopeValidator;

impl RecordValidator for SignedEnvelopeValidator {
    fn validate(&self, _key: &[u8], value: &[u8]) -> Result<()> {
        let envelope = SignedEnvelope::decode(value)
            .map_err(|err| KadError::InvalidRecord(format!("malformed envelope: {err}")))?;
        let pub_key_arr: [u8; 32] = envelope
            .pub_key
            .as_slice()
            .try_into()
            .map_err(|_| KadError::InvalidRecord("malformed envelope public key".into()))?;
        let pub_key = VerifyingKey::from_bytes(&pub_key_arr)
            .map_err(|err| KadError::InvalidRecord(format!("bad envelope public key: {err}")))?;
        let signature = Signature::from_slice(&envelope.signature)
            .map_err(|err| KadError::InvalidRecord(format!("malformed envelope signature: {err}")))?;
        pub_key
            .verify_strict(&envelope.payload, &signature)
            .map_err(|_| KadError::InvalidRecord("envelope signature verification failed".into()))
    }
}

/// Validates the `/pk/` namespace, where the value IS a public key and the
/// key suffix must be its hash.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublicKeyValidator;

impl RecordValidator for PublicKeyValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let id = key.strip_prefix(b"/pk/").ok_or_else(|| {
            KadError::InvalidRecord("public-key record outside the /pk/ namespace".into())
        })?;
        let digest = Sha256::digest(value);
        if digest.as_slice() != id {
            return Err(KadError::InvalidRecord(
                "public key does not hash to the record's identity".into(),
            ));
        }
        Ok(())
    }
}

/// The stock validator: size limits only. Signature checking is a plug-in
/// concern, not a default.
#[derive(Clone, Copy, Debug)]
pub struct DefaultValidator {
    key_length: KeyLengthValidator,
    value_size: ValueSizeValidator,
}

impl Default for DefaultValidator {
    fn default() -> Self {
        Self {
            key_length: KeyLengthValidator { max_len: 1024 },
            value_size: ValueSizeValidator {
                max_bytes: 64 * 1024,
            },
        }
    }
}

impl RecordValidator for DefaultValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.key_length.validate(key, value)?;
        self.value_size.validate(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(values: &[&[u8]]) -> Vec<Record> {
        values
            .iter()
            .map(|v| Record::new(b"k".to_vec(), v.to_vec()))
            .collect()
    }

    #[test]
    fn default_select_is_first_wins() {
        let validator = AcceptAllValidator;
        assert_eq!(validator.select(b"k", &records(&[b"a", b"b"])), 0);
    }

    #[test]
    fn size_validators_enforce_limits() {
        let validator = DefaultValidator::default();
        assert!(validator.validate(b"key", b"value").is_ok());
        assert!(validator.validate(b"", b"value").is_err());
        assert!(validator.validate(&vec![b'k'; 2048], b"v").is_err());
        assert!(validator.validate(b"key", &vec![0u8; 128 * 1024]).is_err());
    }

    #[test]
    fn composite_is_an_and_fold() {
        let composite = CompositeValidator::new(vec![
            Arc::new(KeyLengthValidator { max_len: 8 }),
            Arc::new(ValueSizeValidator { max_bytes: 4 }),
        ]);
        assert!(composite.validate(b"short", b"ok").is_ok());
        assert!(composite.validate(b"way-too-long-key", b"ok").is_err());
        assert!(composite.validate(b"short", b"too big").is_err());
    }

    #[test]
    fn namespace_prefix_extraction() {
        assert_eq!(namespace_prefix(b"/ipns/abc"), Some(&b"/ipns/"[..]));
        assert_eq!(namespace_prefix(b"/pk/xyz"), Some(&b"/pk/"[..]));
        assert_eq!(namespace_prefix(b"no-namespace"), None);
        assert_eq!(namespace_prefix(b"/unterminated"), None);
    }

    #[test]
    fn signed_envelopes_verify_and_tampering_fails() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let envelope = seal_envelope(&key, b"payload".to_vec());
        let validator = SignedEnvelopeValidator;

        assert!(validator
            .validate(b"/env/k", &envelope.encode_to_vec())
            .is_ok());

        let mut tampered = envelope.clone();
        tampered.payload[0] ^= 1;
        assert!(validator
            .validate(b"/env/k", &tampered.encode_to_vec())
            .is_err());
        assert!(validator.validate(b"/env/k", b"not an envelope").is_err());
    }

    #[test]
    fn public_key_records_must_hash_to_their_key() {
        let signing = SigningKey::from_bytes(&[4u8; 32]);
        let pub_key = signing.verifying_key().as_bytes().to_vec();
        let mut key = b"/pk/".to_vec();
        key.extend_from_slice(&Sha256::digest(&pub_key));

        let validator = PublicKeyValidator;
        assert!(validator.validate(&key, &pub_key).is_ok());
        assert!(validator.validate(&key, b"some other key").is_err());
        assert!(validator.validate(b"/pk/short", &pub_key).is_err());
        assert!(validator.validate(b"elsewhere", &pub_key).is_err());
    }

    #[test]
    fn namespaced_dispatch_and_fallback() {
        let validator = NamespacedValidator::new(NamespaceFallback::Reject)
            .with_namespace("ok", Arc::new(AcceptAllValidator));

        assert!(validator.validate(b"/ok/key", b"v").is_ok());
        assert!(validator.validate(b"/other/key", b"v").is_err());
        assert!(validator.validate(b"plain", b"v").is_err());

        let permissive = NamespacedValidator::new(NamespaceFallback::Accept)
            .with_namespace("no", Arc::new(RejectAllValidator));
        assert!(permissive.validate(b"/no/key", b"v").is_err());
        assert!(permissive.validate(b"plain", b"v").is_ok());
    }
}
