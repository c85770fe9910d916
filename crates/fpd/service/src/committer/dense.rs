use async_trait::async_trait;
use fpd_clients::{
    CommitPubRandRequest, ConsumerController, EotsManager, PubRandProofStore, TxResponse,
};
use fpd_types::{
    BtcPublicKey, MerkleProof, PubRandCommitment, commit_sign_message,
    commitment::{checked_end_height, committed_heights},
    merkle::proofs_from_byte_slices,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::{CommitDecision, CommitError, RandomnessCommitter};
use crate::FpdConfig;

/// Start height of the next dense commitment.
///
/// Randomness must be committed `delay` blocks ahead of the tip so it is
/// timestamped before use, and topped up while less than `num_pub_rand`
/// heights remain committed beyond that point.
pub const fn dense_start_height(
    last_committed: u64,
    tip: u64,
    delay: u64,
    num_pub_rand: u64,
) -> Option<u64> {
    let target = tip.saturating_add(delay);
    if last_committed < target {
        Some(target)
    } else if last_committed < target.saturating_add(num_pub_rand) {
        Some(last_committed + 1)
    } else {
        None
    }
}

/// Commits one randomness value for every height
#[derive(Debug)]
pub struct DefaultRandomnessCommitter {
    btc_pk: BtcPublicKey,
    chain_id: String,
    num_pub_rand: u64,
    timestamping_delay_blocks: u64,
    context_signing_height: Option<u64>,
    client: Arc<dyn ConsumerController>,
    eots: Arc<dyn EotsManager>,
    proofs: Arc<dyn PubRandProofStore>,
}

impl DefaultRandomnessCommitter {
    /// Create a committer for one provider
    pub fn new(
        btc_pk: BtcPublicKey,
        config: &FpdConfig,
        client: Arc<dyn ConsumerController>,
        eots: Arc<dyn EotsManager>,
        proofs: Arc<dyn PubRandProofStore>,
    ) -> Self {
        Self {
            btc_pk,
            chain_id: config.chain_id.clone(),
            num_pub_rand: config.num_pub_rand,
            timestamping_delay_blocks: config.timestamping_delay_blocks,
            context_signing_height: config.context_signing_height,
            client,
            eots,
            proofs,
        }
    }

    pub(crate) const fn num_pub_rand(&self) -> u64 {
        self.num_pub_rand
    }

    pub(crate) const fn timestamping_delay_blocks(&self) -> u64 {
        self.timestamping_delay_blocks
    }

    pub(crate) async fn tip_height(&self) -> Result<u64, CommitError> {
        Ok(self.client.query_latest_block().await?.height)
    }

    pub(crate) async fn activation_height(&self) -> Result<u64, CommitError> {
        Ok(self.client.query_activated_height().await?)
    }

    pub(crate) async fn last_commit(&self) -> Result<Option<PubRandCommitment>, CommitError> {
        Ok(self.client.query_last_pub_rand_commit(self.btc_pk).await?)
    }

    /// Generate, store, sign and submit `num_pub_rand` values spaced
    /// `interval` apart from `start_height`
    pub(crate) async fn commit_with_interval(
        &self,
        start_height: u64,
        interval: u64,
    ) -> Result<Option<TxResponse>, CommitError> {
        let num = self.num_pub_rand;
        if num == 0 {
            return Err(CommitError::ZeroPubRand);
        }
        let end_height = checked_end_height(start_height, num, interval)?;

        let values = self
            .eots
            .create_randomness_pairs(self.btc_pk, &self.chain_id, start_height, num, interval)
            .await?;
        if values.len() as u64 != num {
            return Err(CommitError::RandomnessCountMismatch { expected: num, got: values.len() });
        }

        let (root, proofs) = proofs_from_byte_slices(&values);
        let entries: Vec<(u64, MerkleProof)> =
            committed_heights(start_height, num, interval).zip(proofs).collect();
        let stored = self.proofs.add_pub_rand_proofs(&self.chain_id, &self.btc_pk, &entries)?;

        let tip = self.tip_height().await?;
        let context = if self.context_signing_height.is_some_and(|height| tip >= height) {
            self.client.pub_rand_commit_context()
        } else {
            String::new()
        };
        let msg = commit_sign_message(&context, start_height, num, &root);
        let signature = self.eots.sign_schnorr(self.btc_pk, msg.as_slice()).await?;

        let req = CommitPubRandRequest {
            fp_pk: self.btc_pk,
            start_height,
            num_pub_rand: num,
            interval,
            commitment: root,
            signature,
        };
        match self.client.commit_pub_rand_list(req).await {
            Ok(tx) => {
                info!(
                    target: "fpd::committer",
                    fp_pk = %self.btc_pk,
                    start_height,
                    end_height,
                    interval,
                    proofs_stored = stored,
                    tx_hash = %tx.tx_hash,
                    "Committed public randomness"
                );
                Ok(Some(tx))
            }
            Err(e) if e.is_expected() => {
                debug!(
                    target: "fpd::committer",
                    start_height,
                    error = %e,
                    "Randomness commitment already on chain"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn stored_proofs(&self, heights: &[u64]) -> Result<Vec<MerkleProof>, CommitError> {
        Ok(self.proofs.get_pub_rand_proofs(&self.chain_id, &self.btc_pk, heights)?)
    }
}

#[async_trait]
impl RandomnessCommitter for DefaultRandomnessCommitter {
    async fn should_commit(&self) -> Result<Option<CommitDecision>, CommitError> {
        let last_committed = self.last_committed_height().await?;
        let tip = self.tip_height().await?;

        let Some(start) =
            dense_start_height(last_committed, tip, self.timestamping_delay_blocks, self.num_pub_rand)
        else {
            debug!(
                target: "fpd::committer",
                last_committed,
                tip,
                "Enough public randomness committed"
            );
            return Ok(None);
        };

        let activation = self.activation_height().await?;
        Ok(Some(CommitDecision { start_height: start.max(activation), tip_height: tip }))
    }

    async fn commit(&self, start_height: u64) -> Result<Option<TxResponse>, CommitError> {
        self.commit_with_interval(start_height, 1).await
    }

    async fn last_committed_height(&self) -> Result<u64, CommitError> {
        Ok(self.last_commit().await?.map_or(0, |c| c.end_height()))
    }

    async fn next_start_height(&self) -> Result<u64, CommitError> {
        let last_committed = self.last_committed_height().await?;
        let activation = self.activation_height().await?;
        Ok(last_committed.saturating_add(1).max(activation))
    }

    async fn is_voting_height(&self, _height: u64) -> Result<bool, CommitError> {
        Ok(true)
    }

    fn pub_rand_proofs(&self, heights: &[u64]) -> Result<Vec<MerkleProof>, CommitError> {
        self.stored_proofs(heights)
    }

    fn interval(&self) -> u64 {
        1
    }
}
