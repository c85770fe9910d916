use async_trait::async_trait;
use fpd_clients::{EotsManager, StoreError};
use fpd_types::{BlockDescriptor, BtcPublicKey, MerkleProof, PubRand};
use std::{fmt::Debug, sync::Arc};

use super::SubmitError;
use crate::{CommitError, RandomnessCommitter};

/// Fetches the committed randomness and inclusion proof for each block
#[async_trait]
pub trait FinalitySubmissionStrategy: Send + Sync + Debug {
    /// One `(randomness, proof)` pair per block, in block order.
    ///
    /// `blocks` is sorted by height without duplicates.
    async fn pub_rand_for_blocks(
        &self,
        fp_pk: BtcPublicKey,
        chain_id: &str,
        blocks: &[BlockDescriptor],
    ) -> Result<Vec<(PubRand, MerkleProof)>, SubmitError>;

    /// Whether `height` can carry a vote at all. Checked before voting power
    /// so heights without randomness never reach the proof lookup.
    async fn is_voting_height(&self, _height: u64) -> Result<bool, SubmitError> {
        Ok(true)
    }
}

fn proofs_for(
    committer: &dyn RandomnessCommitter,
    blocks: &[BlockDescriptor],
) -> Result<Vec<MerkleProof>, SubmitError> {
    let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
    committer.pub_rand_proofs(&heights).map_err(|e| match e {
        CommitError::Store(StoreError::ProofNotFound { height }) => {
            SubmitError::MissingProof { height }
        }
        other => SubmitError::Randomness(other),
    })
}

/// Randomness committed for every height: one contiguous range per batch
#[derive(Debug, Clone)]
pub struct DenseRandomness {
    eots: Arc<dyn EotsManager>,
    committer: Arc<dyn RandomnessCommitter>,
}

impl DenseRandomness {
    /// Create the strategy
    pub fn new(eots: Arc<dyn EotsManager>, committer: Arc<dyn RandomnessCommitter>) -> Self {
        Self { eots, committer }
    }
}

#[async_trait]
impl FinalitySubmissionStrategy for DenseRandomness {
    async fn pub_rand_for_blocks(
        &self,
        fp_pk: BtcPublicKey,
        chain_id: &str,
        blocks: &[BlockDescriptor],
    ) -> Result<Vec<(PubRand, MerkleProof)>, SubmitError> {
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            return Ok(Vec::new());
        };

        let proofs = proofs_for(self.committer.as_ref(), blocks)?;
        let first_height = first.height;
        let count = last.height - first_height + 1;
        let values =
            self.eots.create_randomness_pairs(fp_pk, chain_id, first_height, count, 1).await?;

        blocks
            .iter()
            .zip(proofs)
            .map(|(block, proof)| {
                let index = (block.height - first_height) as usize;
                values
                    .get(index)
                    .map(|value| (*value, proof))
                    .ok_or(SubmitError::MissingRandomness { height: block.height })
            })
            .collect()
    }
}

/// Randomness committed every n-th height: one value per block
#[derive(Debug, Clone)]
pub struct IntervalRandomness {
    eots: Arc<dyn EotsManager>,
    committer: Arc<dyn RandomnessCommitter>,
}

impl IntervalRandomness {
    /// Create the strategy
    pub fn new(eots: Arc<dyn EotsManager>, committer: Arc<dyn RandomnessCommitter>) -> Self {
        Self { eots, committer }
    }
}

#[async_trait]
impl FinalitySubmissionStrategy for IntervalRandomness {
    async fn pub_rand_for_blocks(
        &self,
        fp_pk: BtcPublicKey,
        chain_id: &str,
        blocks: &[BlockDescriptor],
    ) -> Result<Vec<(PubRand, MerkleProof)>, SubmitError> {
        let proofs = proofs_for(self.committer.as_ref(), blocks)?;

        let mut out = Vec::with_capacity(blocks.len());
        for (block, proof) in blocks.iter().zip(proofs) {
            let value = self
                .eots
                .create_randomness_pairs(fp_pk, chain_id, block.height, 1, 1)
                .await?
                .first()
                .copied()
                .ok_or(SubmitError::MissingRandomness { height: block.height })?;
            out.push((value, proof));
        }
        Ok(out)
    }

    async fn is_voting_height(&self, height: u64) -> Result<bool, SubmitError> {
        self.committer.is_voting_height(height).await.map_err(|e| match e {
            CommitError::Client(e) => SubmitError::Query(e),
            other => SubmitError::Randomness(other),
        })
    }
}
