//! Local persistence interfaces

use fpd_types::{BtcPublicKey, MerkleProof, ProviderState, ProviderStatus};
use std::fmt::Debug;

use crate::StoreError;

/// Storage of finality provider records
pub trait ProviderStore: Send + Sync + Debug {
    /// Insert a new record
    fn create_provider(&self, state: ProviderState) -> Result<(), StoreError>;

    /// Load a record
    fn get_provider(&self, fp_pk: &BtcPublicKey) -> Result<ProviderState, StoreError>;

    /// Change the status, enforcing the status state machine
    fn set_status(&self, fp_pk: &BtcPublicKey, status: ProviderStatus) -> Result<(), StoreError>;

    /// Raise the last voted height. Lower values leave the record untouched.
    ///
    /// Returns the stored value after the update.
    fn set_last_voted_height(&self, fp_pk: &BtcPublicKey, height: u64) -> Result<u64, StoreError>;
}

/// Storage of randomness inclusion proofs keyed by `(chain_id, fp_pk, height)`
pub trait PubRandProofStore: Send + Sync + Debug {
    /// Insert proofs; heights that already have a proof are skipped.
    ///
    /// Returns the number of newly stored proofs.
    fn add_pub_rand_proofs(
        &self,
        chain_id: &str,
        fp_pk: &BtcPublicKey,
        proofs: &[(u64, MerkleProof)],
    ) -> Result<usize, StoreError>;

    /// Proof at one height
    fn get_pub_rand_proof(
        &self,
        chain_id: &str,
        fp_pk: &BtcPublicKey,
        height: u64,
    ) -> Result<Option<MerkleProof>, StoreError>;

    /// Proofs at `heights`, in the same order. Any missing height is an error.
    fn get_pub_rand_proofs(
        &self,
        chain_id: &str,
        fp_pk: &BtcPublicKey,
        heights: &[u64],
    ) -> Result<Vec<MerkleProof>, StoreError> {
        heights
            .iter()
            .map(|&height| {
                self.get_pub_rand_proof(chain_id, fp_pk, height)?
                    .ok_or(StoreError::ProofNotFound { height })
            })
            .collect()
    }
}
