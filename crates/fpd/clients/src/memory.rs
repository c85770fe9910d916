//! In-memory store implementations

use fpd_types::{BtcPublicKey, MerkleProof, ProviderState, ProviderStatus};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::{ProviderStore, PubRandProofStore, StoreError};

/// Provider records held in a map
#[derive(Debug, Default)]
pub struct MemProviderStore {
    providers: RwLock<HashMap<BtcPublicKey, ProviderState>>,
}

impl MemProviderStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProviderStore for MemProviderStore {
    fn create_provider(&self, state: ProviderState) -> Result<(), StoreError> {
        let mut providers = self.providers.write();
        if providers.contains_key(&state.btc_pk) {
            return Err(StoreError::ProviderExists(state.btc_pk));
        }
        providers.insert(state.btc_pk, state);
        Ok(())
    }

    fn get_provider(&self, fp_pk: &BtcPublicKey) -> Result<ProviderState, StoreError> {
        self.providers.read().get(fp_pk).cloned().ok_or(StoreError::ProviderNotFound(*fp_pk))
    }

    fn set_status(&self, fp_pk: &BtcPublicKey, status: ProviderStatus) -> Result<(), StoreError> {
        let mut providers = self.providers.write();
        let state = providers.get_mut(fp_pk).ok_or(StoreError::ProviderNotFound(*fp_pk))?;
        if !state.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition { from: state.status, to: status });
        }
        state.status = status;
        Ok(())
    }

    fn set_last_voted_height(&self, fp_pk: &BtcPublicKey, height: u64) -> Result<u64, StoreError> {
        let mut providers = self.providers.write();
        let state = providers.get_mut(fp_pk).ok_or(StoreError::ProviderNotFound(*fp_pk))?;
        state.bump_last_voted_height(height);
        Ok(state.last_voted_height)
    }
}

type ProofKey = (String, BtcPublicKey);

/// Randomness proofs held in ordered per-provider maps
#[derive(Debug, Default)]
pub struct MemPubRandProofStore {
    proofs: RwLock<HashMap<ProofKey, BTreeMap<u64, MerkleProof>>>,
}

impl MemPubRandProofStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of proofs stored for a provider
    pub fn len(&self, chain_id: &str, fp_pk: &BtcPublicKey) -> usize {
        self.proofs
            .read()
            .get(&(chain_id.to_string(), *fp_pk))
            .map_or(0, BTreeMap::len)
    }
}

impl PubRandProofStore for MemPubRandProofStore {
    fn add_pub_rand_proofs(
        &self,
        chain_id: &str,
        fp_pk: &BtcPublicKey,
        proofs: &[(u64, MerkleProof)],
    ) -> Result<usize, StoreError> {
        let mut all = self.proofs.write();
        let entry = all.entry((chain_id.to_string(), *fp_pk)).or_default();

        let mut inserted = 0;
        for (height, proof) in proofs {
            if entry.contains_key(height) {
                continue;
            }
            entry.insert(*height, proof.clone());
            inserted += 1;
        }

        debug!(
            target: "fpd::store",
            chain_id,
            fp_pk = %fp_pk,
            inserted,
            skipped = proofs.len() - inserted,
            "Stored public randomness proofs"
        );
        Ok(inserted)
    }

    fn get_pub_rand_proof(
        &self,
        chain_id: &str,
        fp_pk: &BtcPublicKey,
        height: u64,
    ) -> Result<Option<MerkleProof>, StoreError> {
        Ok(self
            .proofs
            .read()
            .get(&(chain_id.to_string(), *fp_pk))
            .and_then(|by_height| by_height.get(&height).cloned()))
    }
}
