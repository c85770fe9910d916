//! Deterministic EOTS signer

use alloy_primitives::{B256, Bytes};
use async_trait::async_trait;
use fpd_clients::{EotsManager, SignerError};
use fpd_types::{BtcPublicKey, EotsSignature, PubRand};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;

fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    for part in parts {
        hasher.update(part);
    }
    B256::from_slice(&hasher.finalize())
}

/// Signer deriving keys, randomness and signatures from a seed with SHA-256.
///
/// Not cryptographically meaningful; it reproduces the signer's contract:
/// deterministic randomness per height and refusal to sign two different
/// messages at one height.
#[derive(Debug)]
pub struct SimulatedEotsManager {
    seed: B256,
    keys: RwLock<HashMap<BtcPublicKey, B256>>,
    /// Hash of the message signed per `(key, chain, height)`
    signed: Mutex<HashMap<(BtcPublicKey, String, u64), B256>>,
}

impl SimulatedEotsManager {
    /// Create a signer with no keys
    pub fn new(seed: B256) -> Self {
        Self { seed, keys: RwLock::default(), signed: Mutex::default() }
    }

    /// Derive (or re-derive) the key named `name` and return its public key
    pub fn create_key(&self, name: &str) -> BtcPublicKey {
        let secret = tagged_hash(b"fpd-devnet/sk", &[self.seed.as_slice(), name.as_bytes()]);
        let public = tagged_hash(b"fpd-devnet/pk", &[secret.as_slice()]);
        self.keys.write().insert(public, secret);
        public
    }

    /// Number of heights signed for a key on a chain
    pub fn signed_count(&self, fp_pk: &BtcPublicKey, chain_id: &str) -> usize {
        self.signed.lock().keys().filter(|(pk, chain, _)| pk == fp_pk && chain == chain_id).count()
    }

    fn secret(&self, fp_pk: &BtcPublicKey) -> Result<B256, SignerError> {
        self.keys.read().get(fp_pk).copied().ok_or(SignerError::KeyNotFound(*fp_pk))
    }
}

#[async_trait]
impl EotsManager for SimulatedEotsManager {
    async fn create_randomness_pairs(
        &self,
        fp_pk: BtcPublicKey,
        chain_id: &str,
        start_height: u64,
        num: u64,
        interval: u64,
    ) -> Result<Vec<PubRand>, SignerError> {
        if interval == 0 {
            return Err(SignerError::Other("randomness interval must be at least 1".to_string()));
        }
        let secret = self.secret(&fp_pk)?;
        (0..num)
            .map(|i| {
                let height = i
                    .checked_mul(interval)
                    .and_then(|offset| start_height.checked_add(offset))
                    .ok_or_else(|| SignerError::Other("randomness height overflow".to_string()))?;
                Ok(tagged_hash(
                    b"fpd-devnet/rand",
                    &[secret.as_slice(), chain_id.as_bytes(), height.to_be_bytes().as_slice()],
                ))
            })
            .collect()
    }

    async fn sign_schnorr(&self, fp_pk: BtcPublicKey, msg: &[u8]) -> Result<Bytes, SignerError> {
        let secret = self.secret(&fp_pk)?;
        let r = tagged_hash(b"fpd-devnet/schnorr-r", &[secret.as_slice(), msg]);
        let s = tagged_hash(b"fpd-devnet/schnorr-s", &[secret.as_slice(), r.as_slice(), msg]);
        Ok(Bytes::from([r.as_slice(), s.as_slice()].concat()))
    }

    async fn sign_eots(
        &self,
        fp_pk: BtcPublicKey,
        chain_id: &str,
        msg: &[u8],
        height: u64,
    ) -> Result<EotsSignature, SignerError> {
        let secret = self.secret(&fp_pk)?;
        let msg_hash = tagged_hash(b"fpd-devnet/msg", &[msg]);

        let mut signed = self.signed.lock();
        let key = (fp_pk, chain_id.to_string(), height);
        match signed.get(&key) {
            Some(previous) if *previous != msg_hash => {
                warn!(
                    target: "fpd::devnet",
                    %fp_pk,
                    height,
                    "Refusing to sign a second message at the same height"
                );
                return Err(SignerError::PreconditionFailed { height });
            }
            Some(_) => {}
            None => {
                signed.insert(key, msg_hash);
            }
        }

        Ok(tagged_hash(
            b"fpd-devnet/eots",
            &[
                secret.as_slice(),
                chain_id.as_bytes(),
                height.to_be_bytes().as_slice(),
                msg_hash.as_slice(),
            ],
        ))
    }
}
