//! Finality vote submission
//!
//! A batch goes through a pre-filter (duplicates, already voted heights,
//! the strategy's voting heights, voting power) and then up to `max_submission_retries` sign-and-submit
//! attempts. Chain errors are classified:
//!
//! | chain error                     | outcome                               |
//! |---------------------------------|---------------------------------------|
//! | mentions `slashed` / `jailed`   | [`SubmitError::Slashed`] / `Jailed`   |
//! | expected (duplicate vote)       | `Ok(None)`                            |
//! | unrecoverable                   | [`SubmitError::Unrecoverable`]        |
//! | anything else                   | retried, or `Ok(None)` once finalized |

mod strategy;

pub use strategy::{DenseRandomness, FinalitySubmissionStrategy, IntervalRandomness};

use fpd_clients::{
    ClientError, ConsumerController, EotsManager, FinalitySigSubmission, SignerError, StoreError,
    SubmitFinalitySigsRequest, TxResponse,
};
use fpd_types::{
    BlockDescriptor, BtcPublicKey, EotsSignature, ProviderStatus, RetryPolicy,
    retry::{RetryError, retry_when, sleep_or_shutdown},
};
use std::{
    collections::HashSet,
    sync::{Arc, OnceLock},
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{CommitError, FpdConfig, ProviderStateHandle};

/// Finality vote submission errors
#[derive(Debug, Error)]
pub enum SubmitError {
    /// [`FinalitySubmitter::init_state`] was never called
    #[error("finality submitter state is not initialized")]
    StateNotInitialized,

    /// [`FinalitySubmitter::init_state`] was called twice
    #[error("finality submitter state is already initialized")]
    StateAlreadyInitialized,

    /// The batch holds the same height twice
    #[error("duplicate height {0} in finality signature batch")]
    DuplicateHeight(u64),

    /// No stored inclusion proof for a height
    #[error("public randomness proof missing for height {height}")]
    MissingProof {
        /// Height without a proof
        height: u64,
    },

    /// The signer did not return randomness for a height
    #[error("public randomness missing for height {height}")]
    MissingRandomness {
        /// Height without randomness
        height: u64,
    },

    /// The provider is jailed on chain
    #[error("finality provider is jailed")]
    Jailed,

    /// The provider is slashed on chain
    #[error("finality provider is slashed")]
    Slashed,

    /// The chain rejected the batch for good
    #[error("unrecoverable submission error: {0}")]
    Unrecoverable(ClientError),

    /// Every attempt failed
    #[error("failed to submit finality signatures after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the last attempt
        last_error: ClientError,
    },

    /// Voting power could not be queried
    #[error("failed to query voting power: {0}")]
    Query(ClientError),

    /// Proof lookup failure other than a missing proof
    #[error(transparent)]
    Randomness(CommitError),

    /// Signer failure
    #[error(transparent)]
    Signer(#[from] SignerError),

    /// Provider state could not be persisted
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Submission settings
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Attempts per batch
    pub max_submission_retries: u32,
    /// Delay between attempts
    pub submission_retry_interval: Duration,
    /// Height from which vote messages carry the signing context
    pub context_signing_height: Option<u64>,
    /// Retry policy for voting power queries
    pub query_retry: RetryPolicy,
}

impl From<&FpdConfig> for SubmitterConfig {
    fn from(config: &FpdConfig) -> Self {
        Self {
            max_submission_retries: config.max_submission_retries,
            submission_retry_interval: config.submission_retry_interval,
            context_signing_height: config.context_signing_height,
            query_retry: config.query_retry,
        }
    }
}

enum AttemptError {
    Final(SubmitError),
    Expected(ClientError),
    Retryable(ClientError),
}

/// Signs and submits finality votes for one provider
#[derive(Debug)]
pub struct FinalitySubmitter {
    state: OnceLock<ProviderStateHandle>,
    config: SubmitterConfig,
    client: Arc<dyn ConsumerController>,
    eots: Arc<dyn EotsManager>,
    strategy: Arc<dyn FinalitySubmissionStrategy>,
    shutdown: CancellationToken,
}

impl FinalitySubmitter {
    /// Create a submitter; bind it to a provider with [`Self::init_state`]
    pub fn new(
        config: SubmitterConfig,
        client: Arc<dyn ConsumerController>,
        eots: Arc<dyn EotsManager>,
        strategy: Arc<dyn FinalitySubmissionStrategy>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { state: OnceLock::new(), config, client, eots, strategy, shutdown }
    }

    /// Bind the provider state. Can only be done once.
    pub fn init_state(&self, state: ProviderStateHandle) -> Result<(), SubmitError> {
        self.state.set(state).map_err(|_| SubmitError::StateAlreadyInitialized)
    }

    fn state(&self) -> Result<&ProviderStateHandle, SubmitError> {
        self.state.get().ok_or(SubmitError::StateNotInitialized)
    }

    /// Vote on `blocks`.
    ///
    /// Returns `None` when nothing was submitted: no eligible block, the
    /// votes already landed, the batch got finalized meanwhile, or shutdown.
    pub async fn submit_batch_finality_signatures(
        &self,
        blocks: &[BlockDescriptor],
    ) -> Result<Option<TxResponse>, SubmitError> {
        let state = self.state()?;
        if blocks.is_empty() {
            return Ok(None);
        }

        let mut seen = HashSet::with_capacity(blocks.len());
        if let Some(dup) = blocks.iter().find(|b| !seen.insert(b.height)) {
            return Err(SubmitError::DuplicateHeight(dup.height));
        }

        let Some(eligible) = self.filter_eligible(state, blocks).await? else {
            return Ok(None);
        };
        if eligible.is_empty() {
            return Ok(None);
        }
        self.submit_with_retry(state, &eligible).await
    }

    /// Blocks above the last voted height on the strategy's voting heights
    /// that the provider has voting power for, sorted by height. `None` on
    /// shutdown.
    async fn filter_eligible(
        &self,
        state: &ProviderStateHandle,
        blocks: &[BlockDescriptor],
    ) -> Result<Option<Vec<BlockDescriptor>>, SubmitError> {
        let fp_pk = state.btc_pk();
        let last_voted = state.last_voted_height();

        let mut candidates: Vec<&BlockDescriptor> =
            blocks.iter().filter(|b| b.height > last_voted).collect();
        candidates.sort_by_key(|b| b.height);

        let mut eligible = Vec::with_capacity(candidates.len());
        let mut latest_power = None;
        for block in candidates {
            let height = block.height;
            if !self.strategy.is_voting_height(height).await? {
                trace!(target: "fpd::submitter", height, "Not a voting height, skipping block");
                continue;
            }
            let has_power = match retry_when(
                &self.config.query_retry,
                &self.shutdown,
                "query_has_voting_power",
                || self.client.query_has_voting_power(fp_pk, height),
                |e: &ClientError| !e.is_unrecoverable(),
            )
            .await
            {
                Ok(has_power) => has_power,
                Err(RetryError::Cancelled) => return Ok(None),
                Err(RetryError::Failed(e)) => return Err(SubmitError::Query(e)),
            };

            latest_power = Some(has_power);
            if has_power {
                eligible.push(block.clone());
            } else {
                debug!(target: "fpd::submitter", height, "No voting power, skipping block");
            }
        }

        self.update_status(state, latest_power)?;
        Ok(Some(eligible))
    }

    fn update_status(
        &self,
        state: &ProviderStateHandle,
        latest_power: Option<bool>,
    ) -> Result<(), SubmitError> {
        let status = state.status();
        if status.is_terminal() {
            return Ok(());
        }
        match latest_power {
            Some(true) if status != ProviderStatus::Active => {
                state.set_status(ProviderStatus::Active)?;
            }
            Some(false) if status == ProviderStatus::Active => {
                state.set_status(ProviderStatus::Inactive)?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn submit_with_retry(
        &self,
        state: &ProviderStateHandle,
        blocks: &[BlockDescriptor],
    ) -> Result<Option<TxResponse>, SubmitError> {
        let Some(highest) = blocks.last().map(|b| b.height) else {
            return Ok(None);
        };

        let mut failures = 0u32;
        loop {
            let err = match self.try_submit(state, blocks).await {
                Ok(res) => return Ok(res),
                Err(AttemptError::Final(e)) => return Err(e),
                Err(AttemptError::Expected(e)) => {
                    debug!(
                        target: "fpd::submitter",
                        highest,
                        error = %e,
                        "Finality votes already recorded"
                    );
                    return Ok(None);
                }
                Err(AttemptError::Retryable(e)) => e,
            };

            failures += 1;
            warn!(
                target: "fpd::submitter",
                first = blocks[0].height,
                highest,
                failures,
                max_attempts = self.config.max_submission_retries,
                error = %err,
                "Finality signature submission failed"
            );
            if failures >= self.config.max_submission_retries {
                return Err(SubmitError::RetriesExhausted { attempts: failures, last_error: err });
            }

            match self.client.query_is_block_finalized(highest).await {
                Ok(true) => {
                    info!(
                        target: "fpd::submitter",
                        highest,
                        "Block finalized while retrying, dropping submission"
                    );
                    return Ok(None);
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(target: "fpd::submitter", error = %e, "Finalization check failed");
                }
            }

            if !sleep_or_shutdown(self.config.submission_retry_interval, &self.shutdown).await {
                return Ok(None);
            }
        }
    }

    /// One sign-and-submit attempt
    async fn try_submit(
        &self,
        state: &ProviderStateHandle,
        blocks: &[BlockDescriptor],
    ) -> Result<Option<TxResponse>, AttemptError> {
        let fp_pk = state.btc_pk();
        let chain_id = state.chain_id();
        let rands = self
            .strategy
            .pub_rand_for_blocks(fp_pk, &chain_id, blocks)
            .await
            .map_err(AttemptError::Final)?;

        let context = self.client.finality_sig_context();
        let mut votes = Vec::with_capacity(blocks.len());
        for (block, (pub_rand, proof)) in blocks.iter().zip(rands) {
            // Re-checked right before signing; a concurrent submission may
            // have advanced the last voted height.
            if block.height <= state.last_voted_height() {
                continue;
            }
            let signature = match self.sign(fp_pk, &chain_id, &context, block).await {
                Ok(signature) => signature,
                Err(SignerError::PreconditionFailed { height }) => {
                    warn!(
                        target: "fpd::submitter",
                        height,
                        "Signer refused to sign a conflicting message, skipping block"
                    );
                    continue;
                }
                Err(e) => return Err(AttemptError::Final(e.into())),
            };
            votes.push(FinalitySigSubmission { block: block.clone(), pub_rand, proof, signature });
        }

        let Some(max_height) = votes.last().map(|v| v.block.height) else {
            return Ok(None);
        };
        let count = votes.len();
        let req = SubmitFinalitySigsRequest { fp_pk, votes };

        match self.client.submit_batch_finality_sigs(req).await {
            Ok(tx) => {
                state
                    .set_last_voted_height(max_height)
                    .map_err(|e| AttemptError::Final(e.into()))?;
                info!(
                    target: "fpd::submitter",
                    %fp_pk,
                    votes = count,
                    last_voted_height = max_height,
                    tx_hash = %tx.tx_hash,
                    "Submitted finality signatures"
                );
                Ok(Some(tx))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn sign(
        &self,
        fp_pk: BtcPublicKey,
        chain_id: &str,
        context: &str,
        block: &BlockDescriptor,
    ) -> Result<EotsSignature, SignerError> {
        let context =
            if self.config.context_signing_height.is_some_and(|from| block.height >= from) {
                context
            } else {
                ""
            };
        let msg = block.msg_to_sign(context);
        self.eots.sign_eots(fp_pk, chain_id, &msg, block.height).await
    }
}

fn classify(err: ClientError) -> AttemptError {
    if err.mentions("slashed") {
        AttemptError::Final(SubmitError::Slashed)
    } else if err.mentions("jailed") {
        AttemptError::Final(SubmitError::Jailed)
    } else if err.is_expected() {
        AttemptError::Expected(err)
    } else if err.is_unrecoverable() {
        AttemptError::Final(SubmitError::Unrecoverable(err))
    } else {
        AttemptError::Retryable(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultRandomnessCommitter, RandomnessCommitter, test_utils::Harness};
    use alloy_primitives::B256;
    use assert_matches::assert_matches;
    use fpd_clients::MemPubRandProofStore;
    use fpd_devnet::ChainOp;

    fn blocks(h: &Harness, heights: impl IntoIterator<Item = u64>) -> Vec<BlockDescriptor> {
        heights.into_iter().map(|height| h.block(height)).collect()
    }

    #[tokio::test]
    async fn test_init_state_once() {
        let h = Harness::new(1, 10);
        let submitter = h.unbound_submitter(h.dense_committer_arc(), false);
        assert_matches!(
            submitter.submit_batch_finality_signatures(&blocks(&h, [1])).await,
            Err(SubmitError::StateNotInitialized)
        );

        submitter.init_state(h.state()).unwrap();
        assert_matches!(submitter.init_state(h.state()), Err(SubmitError::StateAlreadyInitialized));
    }

    #[tokio::test]
    async fn test_duplicate_heights_rejected_before_signing() {
        let h = Harness::new(1, 10);
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        let submitter = h.submitter(committer, false);

        assert_matches!(
            submitter.submit_batch_finality_signatures(&blocks(&h, [2, 3, 2])).await,
            Err(SubmitError::DuplicateHeight(2))
        );
        assert_eq!(h.signer.signed_count(&h.pk, &h.config.chain_id), 0);
    }

    #[tokio::test]
    async fn test_submission_advances_last_voted_height() {
        let h = Harness::new(1, 10);
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        let state = h.state();
        let submitter = h.submitter_with_state(committer, false, state.clone());

        // Unsorted input is fine
        let tx = submitter.submit_batch_finality_signatures(&blocks(&h, [3, 2])).await.unwrap();
        assert!(tx.is_some());
        assert_eq!(state.last_voted_height(), 3);
        assert_eq!(state.status(), ProviderStatus::Active);
        assert_eq!(h.chain.votes(&h.pk).keys().copied().collect::<Vec<_>>(), vec![2, 3]);

        // Heights at or below the last voted height are dropped
        assert_eq!(submitter.submit_batch_finality_signatures(&blocks(&h, [1, 3])).await.unwrap(), None);
        assert_eq!(h.signer.signed_count(&h.pk, &h.config.chain_id), 2);
    }

    #[tokio::test]
    async fn test_no_voting_power_marks_inactive() {
        let h = Harness::new(1, 10);
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        let state = h.state();
        state.set_status(ProviderStatus::Active).unwrap();
        h.chain.set_voting_power(h.pk, 2, false);
        let submitter = h.submitter_with_state(committer, false, state.clone());

        assert_eq!(submitter.submit_batch_finality_signatures(&blocks(&h, [2])).await.unwrap(), None);
        assert_eq!(state.status(), ProviderStatus::Inactive);
        assert_eq!(state.last_voted_height(), 0);
    }

    #[tokio::test]
    async fn test_missing_proof_is_unrecoverable() {
        let h = Harness::new(1, 10);
        h.dense_committer().commit(1).await.unwrap();

        // Committed on chain, but the proofs live in another store
        let committer = Arc::new(DefaultRandomnessCommitter::new(
            h.pk,
            &h.config,
            h.chain.clone(),
            h.signer.clone(),
            Arc::new(MemPubRandProofStore::new()),
        ));
        let submitter = h.submitter(committer, false);
        assert_matches!(
            submitter.submit_batch_finality_signatures(&blocks(&h, [2])).await,
            Err(SubmitError::MissingProof { height: 2 })
        );
    }

    #[tokio::test]
    async fn test_uncommitted_heights_skipped() {
        let h = Harness::new(1, 10);
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        let state = h.state();
        let submitter = h.submitter_with_state(committer, false, state.clone());

        // Heights 4.. carry no voting power without committed randomness
        submitter.submit_batch_finality_signatures(&blocks(&h, [3, 4, 5])).await.unwrap().unwrap();
        assert_eq!(state.last_voted_height(), 3);
        assert_eq!(h.chain.votes(&h.pk).keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn test_expected_error_absorbed() {
        let h = Harness::new(1, 10);
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        h.chain.inject_failures(
            ChainOp::SubmitFinalitySigs,
            ClientError::Expected("duplicated finality vote".into()),
            1,
        );
        let submitter = h.submitter(committer, false);
        assert_eq!(submitter.submit_batch_finality_signatures(&blocks(&h, [2])).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_jailed_and_slashed_detected() {
        let h = Harness::new(1, 10);
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        let submitter = h.submitter(committer, false);

        h.chain.jail(h.pk);
        assert_matches!(
            submitter.submit_batch_finality_signatures(&blocks(&h, [2])).await,
            Err(SubmitError::Jailed)
        );
        h.chain.slash(h.pk);
        assert_matches!(
            submitter.submit_batch_finality_signatures(&blocks(&h, [2])).await,
            Err(SubmitError::Slashed)
        );
    }

    #[tokio::test]
    async fn test_transient_errors_retried_then_exhausted() {
        let mut h = Harness::new(1, 10);
        h.config.max_submission_retries = 3;
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        let state = h.state();
        let submitter = h.submitter_with_state(committer, false, state.clone());

        h.chain.inject_failures(
            ChainOp::SubmitFinalitySigs,
            ClientError::Transient("timeout".into()),
            2,
        );
        assert!(submitter.submit_batch_finality_signatures(&blocks(&h, [2])).await.unwrap().is_some());
        assert_eq!(state.last_voted_height(), 2);

        h.chain.inject_failures(
            ChainOp::SubmitFinalitySigs,
            ClientError::Transient("timeout".into()),
            3,
        );
        assert_matches!(
            submitter.submit_batch_finality_signatures(&blocks(&h, [3])).await,
            Err(SubmitError::RetriesExhausted { attempts: 3, .. })
        );
        assert_eq!(state.last_voted_height(), 2);
    }

    #[tokio::test]
    async fn test_finalized_during_retry_stops() {
        let h = Harness::new(1, 10);
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        h.chain.finalize(2);
        h.chain.inject_failures(
            ChainOp::SubmitFinalitySigs,
            ClientError::Transient("timeout".into()),
            1,
        );
        let submitter = h.submitter(committer, false);
        assert_eq!(submitter.submit_batch_finality_signatures(&blocks(&h, [2])).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_conflicting_message_never_signed() {
        let h = Harness::new(1, 10);
        let committer = h.dense_committer_arc();
        committer.commit(1).await.unwrap();
        let submitter = h.submitter(committer, false);

        // Height 2 was signed for a fork block before
        let fork = BlockDescriptor::new(2, B256::repeat_byte(0xff).to_vec());
        h.signer.sign_eots(h.pk, &h.config.chain_id, &fork.msg_to_sign(""), 2).await.unwrap();

        assert_eq!(submitter.submit_batch_finality_signatures(&blocks(&h, [2])).await.unwrap(), None);
        assert!(h.chain.votes(&h.pk).is_empty());
    }

    #[tokio::test]
    async fn test_interval_strategy_votes_on_grid() {
        let mut h = Harness::new(100, 120);
        h.config.num_pub_rand = 4;
        let committer: Arc<dyn RandomnessCommitter> = Arc::new(h.interval_committer(5));
        committer.commit(100).await.unwrap();
        let state = h.state();
        let submitter = h.submitter_with_state(committer, true, state.clone());

        submitter.submit_batch_finality_signatures(&blocks(&h, [105, 110])).await.unwrap().unwrap();
        assert_eq!(state.last_voted_height(), 110);
        assert_eq!(h.chain.votes(&h.pk).keys().copied().collect::<Vec<_>>(), vec![105, 110]);

        // Off-grid heights are skipped
        assert_eq!(
            submitter.submit_batch_finality_signatures(&blocks(&h, [112])).await.unwrap(),
            None
        );
        assert_eq!(state.last_voted_height(), 110);
    }

    #[tokio::test]
    async fn test_interval_strategy_skips_off_grid_with_power_everywhere() {
        let mut h = Harness::with_power_everywhere(100, 120);
        h.config.num_pub_rand = 4;
        let committer: Arc<dyn RandomnessCommitter> = Arc::new(h.interval_committer(5));
        committer.commit(100).await.unwrap();
        let state = h.state();
        let submitter = h.submitter_with_state(committer, true, state.clone());

        // Power at 111 is reported, but no randomness is assigned to it
        assert!(h.chain.query_has_voting_power(h.pk, 111).await.unwrap());
        assert_eq!(
            submitter.submit_batch_finality_signatures(&blocks(&h, [111])).await.unwrap(),
            None
        );

        let all: Vec<u64> = (101..=115).collect();
        submitter.submit_batch_finality_signatures(&blocks(&h, all)).await.unwrap().unwrap();
        assert_eq!(h.chain.votes(&h.pk).keys().copied().collect::<Vec<_>>(), vec![105, 110, 115]);
        assert_eq!(state.last_voted_height(), 115);
        assert_eq!(state.status(), ProviderStatus::Active);
    }
}
