//! Shared fixtures for unit tests

use alloy_primitives::B256;
use fpd_clients::{MemProviderStore, MemPubRandProofStore, ProviderStore};
use fpd_devnet::{SimulatedChain, SimulatedChainConfig, SimulatedEotsManager};
use fpd_poller::PollerConfig;
use fpd_types::{BlockDescriptor, BtcPublicKey, ProviderState, RetryPolicy};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    CriticalError, DefaultRandomnessCommitter, DenseRandomness, FinalityProviderInstance,
    FinalitySubmissionStrategy, FinalitySubmitter, FpdConfig, IntervalRandomness,
    IntervalRandomnessCommitter, ProviderStateHandle, RandomnessCommitter,
    submitter::SubmitterConfig,
};

/// A devnet chain, signer and stores with one registered provider
pub(crate) struct Harness {
    pub(crate) chain: Arc<SimulatedChain>,
    pub(crate) signer: Arc<SimulatedEotsManager>,
    pub(crate) providers: Arc<MemProviderStore>,
    pub(crate) proofs: Arc<MemPubRandProofStore>,
    pub(crate) pk: BtcPublicKey,
    pub(crate) config: FpdConfig,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) fn fast_config() -> FpdConfig {
    let query_retry = RetryPolicy::new(3, Duration::from_millis(1));
    FpdConfig {
        num_pub_rand: 3,
        timestamping_delay_blocks: 0,
        batch_submission_size: 10,
        randomness_commit_interval: Duration::from_millis(10),
        submission_retry_interval: Duration::from_millis(1),
        max_submission_retries: 5,
        fast_sync_interval: Duration::from_millis(10),
        status_update_interval: Duration::from_millis(10),
        query_retry,
        poller: PollerConfig {
            buffer_size: 100,
            poll_interval: Duration::from_millis(5),
            poll_size: 100,
            retry: query_retry,
        },
        ..Default::default()
    }
}

impl Harness {
    /// Chain with `tip` blocks and finality active from `activation`
    pub(crate) fn new(activation: u64, tip: u64) -> Self {
        Self::build(activation, tip, true)
    }

    /// Like [`Self::new`], but the chain reports voting power at every height
    /// from activation, committed or not
    pub(crate) fn with_power_everywhere(activation: u64, tip: u64) -> Self {
        Self::build(activation, tip, false)
    }

    fn build(activation: u64, tip: u64, power_requires_commitment: bool) -> Self {
        let config = fast_config();
        let chain = Arc::new(SimulatedChain::new(SimulatedChainConfig {
            chain_id: config.chain_id.clone(),
            activation_height: Some(activation),
            initial_height: tip,
            power_requires_commitment,
            ..Default::default()
        }));
        let signer = Arc::new(SimulatedEotsManager::new(B256::repeat_byte(7)));
        let pk = signer.create_key("fp");
        chain.set_voting_power(pk, activation, true);

        let providers = Arc::new(MemProviderStore::new());
        providers
            .create_provider(ProviderState::new(pk, config.chain_id.clone()))
            .expect("fresh store");

        Self {
            chain,
            signer,
            providers,
            proofs: Arc::new(MemPubRandProofStore::new()),
            pk,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Fresh handle over the stored provider record
    pub(crate) fn state(&self) -> ProviderStateHandle {
        ProviderStateHandle::load(self.providers.clone(), &self.pk).expect("provider exists")
    }

    /// Block at `height` as produced by the chain
    pub(crate) fn block(&self, height: u64) -> BlockDescriptor {
        self.chain.block(height).expect("block produced")
    }

    pub(crate) fn dense_committer(&self) -> DefaultRandomnessCommitter {
        DefaultRandomnessCommitter::new(
            self.pk,
            &self.config,
            self.chain.clone(),
            self.signer.clone(),
            self.proofs.clone(),
        )
    }

    pub(crate) fn dense_committer_arc(&self) -> Arc<dyn RandomnessCommitter> {
        Arc::new(self.dense_committer())
    }

    pub(crate) fn interval_committer(&self, interval: u64) -> IntervalRandomnessCommitter {
        IntervalRandomnessCommitter::new(self.dense_committer(), interval)
            .expect("non-zero interval")
    }

    /// Submitter without provider state; `interval` picks the sparse strategy
    pub(crate) fn unbound_submitter(
        &self,
        committer: Arc<dyn RandomnessCommitter>,
        interval: bool,
    ) -> FinalitySubmitter {
        let strategy: Arc<dyn FinalitySubmissionStrategy> = if interval {
            Arc::new(IntervalRandomness::new(self.signer.clone(), committer))
        } else {
            Arc::new(DenseRandomness::new(self.signer.clone(), committer))
        };
        FinalitySubmitter::new(
            SubmitterConfig::from(&self.config),
            self.chain.clone(),
            self.signer.clone(),
            strategy,
            self.shutdown.clone(),
        )
    }

    pub(crate) fn submitter_with_state(
        &self,
        committer: Arc<dyn RandomnessCommitter>,
        interval: bool,
        state: ProviderStateHandle,
    ) -> FinalitySubmitter {
        let submitter = self.unbound_submitter(committer, interval);
        submitter.init_state(state).expect("first init");
        submitter
    }

    pub(crate) fn submitter(
        &self,
        committer: Arc<dyn RandomnessCommitter>,
        interval: bool,
    ) -> FinalitySubmitter {
        self.submitter_with_state(committer, interval, self.state())
    }

    /// Instance over the harness chain plus its critical-error receiver
    pub(crate) fn instance(&self) -> (FinalityProviderInstance, mpsc::Receiver<CriticalError>) {
        let (critical_tx, critical_rx) = mpsc::channel(1);
        let instance = FinalityProviderInstance::new(
            self.config.clone(),
            self.state(),
            self.chain.clone(),
            self.signer.clone(),
            self.proofs.clone(),
            critical_tx,
            &self.shutdown,
        )
        .expect("valid config");
        (instance, critical_rx)
    }
}
