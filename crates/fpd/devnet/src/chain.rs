//! Simulated consumer chain

use alloy_primitives::{B256, Bytes};
use async_trait::async_trait;
use fpd_clients::{
    ClientError, CommitPubRandRequest, ConsumerController, ProviderChainStatus,
    SubmitFinalitySigsRequest, TxResponse,
};
use fpd_types::{BlockDescriptor, BtcPublicKey, EotsSignature, PubRandCommitment};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chain operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainOp {
    /// `query_latest_block`
    LatestBlock,
    /// `query_block` and `query_blocks`
    Blocks,
    /// `query_activated_height`
    ActivatedHeight,
    /// `query_last_pub_rand_commit`
    LastPubRandCommit,
    /// `query_has_voting_power`
    VotingPower,
    /// `query_provider_status`
    ProviderStatus,
    /// `query_highest_voted_height`
    HighestVoted,
    /// `query_latest_finalized_block` and `query_is_block_finalized`
    Finalized,
    /// `commit_pub_rand_list`
    CommitPubRand,
    /// `submit_batch_finality_sigs`
    SubmitFinalitySigs,
}

/// Configuration of a [`SimulatedChain`]
#[derive(Debug, Clone)]
pub struct SimulatedChainConfig {
    /// Chain identifier, mixed into block hashes and signing contexts
    pub chain_id: String,
    /// Finality activation height; `None` until governance activates it
    pub activation_height: Option<u64>,
    /// Number of blocks produced at construction
    pub initial_height: u64,
    /// Whether messages carry a chain-specific signing context
    pub context_signing: bool,
    /// Blocks per epoch, used to stamp commitments
    pub epoch_length: u64,
    /// Count voting power only at heights with committed randomness.
    /// Rollup consumers report power at every height; turn this off to
    /// model them.
    pub power_requires_commitment: bool,
}

impl Default for SimulatedChainConfig {
    fn default() -> Self {
        Self {
            chain_id: "fpd-devnet-1".to_string(),
            activation_height: Some(1),
            initial_height: 0,
            context_signing: false,
            epoch_length: 100,
            power_requires_commitment: true,
        }
    }
}

#[derive(Debug, Default)]
struct ChainState {
    power_requires_commitment: bool,
    /// `blocks[i]` has height `i + 1`
    blocks: Vec<BlockDescriptor>,
    activation_height: Option<u64>,
    commits: HashMap<BtcPublicKey, Vec<PubRandCommitment>>,
    votes: HashMap<BtcPublicKey, BTreeMap<u64, EotsSignature>>,
    /// Voting power changes keyed by the height they take effect at
    voting_power: HashMap<BtcPublicKey, BTreeMap<u64, bool>>,
    statuses: HashMap<BtcPublicKey, ProviderChainStatus>,
    tx_count: u64,
}

impl ChainState {
    fn tip(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn block(&self, height: u64) -> Option<&BlockDescriptor> {
        let index = usize::try_from(height.checked_sub(1)?).ok()?;
        self.blocks.get(index)
    }

    fn commitment_at(&self, fp_pk: &BtcPublicKey, height: u64) -> Option<&PubRandCommitment> {
        self.commits.get(fp_pk).and_then(|commits| commits.iter().find(|c| c.covers(height)))
    }

    fn has_power(&self, fp_pk: &BtcPublicKey, height: u64) -> bool {
        let granted = self
            .voting_power
            .get(fp_pk)
            .and_then(|changes| changes.range(..=height).next_back())
            .is_some_and(|(_, has_power)| *has_power);
        granted &&
            (!self.power_requires_commitment || self.commitment_at(fp_pk, height).is_some())
    }

    fn status(&self, fp_pk: &BtcPublicKey) -> ProviderChainStatus {
        self.statuses.get(fp_pk).copied().unwrap_or_default()
    }

    fn next_tx_hash(&mut self) -> B256 {
        self.tx_count += 1;
        let mut hasher = Sha256::new();
        hasher.update(b"fpd-devnet/tx");
        hasher.update(self.tx_count.to_be_bytes());
        B256::from_slice(&hasher.finalize())
    }
}

/// An in-memory consumer chain.
///
/// A provider with voting power holds all of it, so a single valid vote
/// finalizes its block.
#[derive(Debug)]
pub struct SimulatedChain {
    config: SimulatedChainConfig,
    state: RwLock<ChainState>,
    faults: Mutex<HashMap<ChainOp, VecDeque<ClientError>>>,
    closed: AtomicBool,
}

impl SimulatedChain {
    /// Create a chain with `config.initial_height` blocks
    pub fn new(config: SimulatedChainConfig) -> Self {
        let state = ChainState {
            power_requires_commitment: config.power_requires_commitment,
            activation_height: config.activation_height,
            ..Default::default()
        };
        let chain = Self {
            config,
            state: RwLock::new(state),
            faults: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        chain.produce_blocks(chain.config.initial_height);
        chain
    }

    /// Chain identifier
    pub fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    /// Append one block
    pub fn produce_block(&self) -> BlockDescriptor {
        let mut state = self.state.write();
        let height = state.tip() + 1;
        let block = BlockDescriptor::new(height, self.block_hash(height));
        state.blocks.push(block.clone());
        block
    }

    /// Append `count` blocks and return the new tip height
    pub fn produce_blocks(&self, count: u64) -> u64 {
        for _ in 0..count {
            self.produce_block();
        }
        self.tip_height()
    }

    /// Current tip height (0 before the first block)
    pub fn tip_height(&self) -> u64 {
        self.state.read().tip()
    }

    /// Block at `height`, if produced
    pub fn block(&self, height: u64) -> Option<BlockDescriptor> {
        self.state.read().block(height).cloned()
    }

    /// Activate finality at `height`
    pub fn set_activation_height(&self, height: u64) {
        self.state.write().activation_height = Some(height);
    }

    /// Give or take voting power from `from_height` onwards.
    ///
    /// Granted power only counts at heights covered by a randomness
    /// commitment of the provider.
    pub fn set_voting_power(&self, fp_pk: BtcPublicKey, from_height: u64, has_power: bool) {
        self.state.write().voting_power.entry(fp_pk).or_default().insert(from_height, has_power);
    }

    /// Jail a provider
    pub fn jail(&self, fp_pk: BtcPublicKey) {
        self.state.write().statuses.entry(fp_pk).or_default().jailed = true;
    }

    /// Slash a provider
    pub fn slash(&self, fp_pk: BtcPublicKey) {
        self.state.write().statuses.entry(fp_pk).or_default().slashed = true;
    }

    /// Mark a block finalized without a vote
    pub fn finalize(&self, height: u64) {
        let mut state = self.state.write();
        if let Some(index) = height.checked_sub(1) {
            if let Some(block) = state.blocks.get_mut(index as usize) {
                block.finalized = true;
            }
        }
    }

    /// Make the next `times` calls of `op` fail with `err`
    pub fn inject_failures(&self, op: ChainOp, err: ClientError, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    /// Votes recorded for a provider, by height
    pub fn votes(&self, fp_pk: &BtcPublicKey) -> BTreeMap<u64, EotsSignature> {
        self.state.read().votes.get(fp_pk).cloned().unwrap_or_default()
    }

    /// Randomness commitments recorded for a provider, oldest first
    pub fn commitments(&self, fp_pk: &BtcPublicKey) -> Vec<PubRandCommitment> {
        self.state.read().commits.get(fp_pk).cloned().unwrap_or_default()
    }

    /// Whether [`ConsumerController::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn block_hash(&self, height: u64) -> Bytes {
        let mut hasher = Sha256::new();
        hasher.update(self.config.chain_id.as_bytes());
        hasher.update(height.to_be_bytes());
        Bytes::copy_from_slice(&hasher.finalize())
    }

    fn context(&self, kind: &str) -> String {
        if self.config.context_signing {
            format!("fpd-devnet/{}/{kind}", self.config.chain_id)
        } else {
            String::new()
        }
    }

    fn check(&self, op: ChainOp) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        match self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(target: "fpd::devnet", ?op, error = %err, "Injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ConsumerController for SimulatedChain {
    async fn query_latest_block(&self) -> Result<BlockDescriptor, ClientError> {
        self.check(ChainOp::LatestBlock)?;
        self.state
            .read()
            .blocks
            .last()
            .cloned()
            .ok_or_else(|| ClientError::Transient("no blocks produced yet".to_string()))
    }

    async fn query_block(&self, height: u64) -> Result<BlockDescriptor, ClientError> {
        self.check(ChainOp::Blocks)?;
        self.state
            .read()
            .block(height)
            .cloned()
            .ok_or_else(|| ClientError::Transient(format!("block {height} not found")))
    }

    async fn query_blocks(
        &self,
        start: u64,
        end: u64,
        limit: u64,
    ) -> Result<Vec<BlockDescriptor>, ClientError> {
        self.check(ChainOp::Blocks)?;
        if start > end {
            return Err(ClientError::Unrecoverable(format!(
                "invalid block range: start {start} > end {end}"
            )));
        }
        let state = self.state.read();
        Ok((start..=end)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map_while(|height| state.block(height).cloned())
            .collect())
    }

    async fn query_activated_height(&self) -> Result<u64, ClientError> {
        self.check(ChainOp::ActivatedHeight)?;
        self.state
            .read()
            .activation_height
            .ok_or_else(|| ClientError::Transient("finality is not activated yet".to_string()))
    }

    async fn query_last_pub_rand_commit(
        &self,
        fp_pk: BtcPublicKey,
    ) -> Result<Option<PubRandCommitment>, ClientError> {
        self.check(ChainOp::LastPubRandCommit)?;
        Ok(self.state.read().commits.get(&fp_pk).and_then(|c| c.last().cloned()))
    }

    async fn query_has_voting_power(
        &self,
        fp_pk: BtcPublicKey,
        height: u64,
    ) -> Result<bool, ClientError> {
        self.check(ChainOp::VotingPower)?;
        Ok(self.state.read().has_power(&fp_pk, height))
    }

    async fn query_provider_status(
        &self,
        fp_pk: BtcPublicKey,
    ) -> Result<ProviderChainStatus, ClientError> {
        self.check(ChainOp::ProviderStatus)?;
        Ok(self.state.read().status(&fp_pk))
    }

    async fn query_highest_voted_height(&self, fp_pk: BtcPublicKey) -> Result<u64, ClientError> {
        self.check(ChainOp::HighestVoted)?;
        Ok(self
            .state
            .read()
            .votes
            .get(&fp_pk)
            .and_then(|v| v.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn query_latest_finalized_block(&self) -> Result<Option<BlockDescriptor>, ClientError> {
        self.check(ChainOp::Finalized)?;
        Ok(self.state.read().blocks.iter().rev().find(|b| b.finalized).cloned())
    }

    async fn query_is_block_finalized(&self, height: u64) -> Result<bool, ClientError> {
        self.check(ChainOp::Finalized)?;
        self.state
            .read()
            .block(height)
            .map(|b| b.finalized)
            .ok_or_else(|| ClientError::Transient(format!("block {height} not found")))
    }

    async fn commit_pub_rand_list(
        &self,
        req: CommitPubRandRequest,
    ) -> Result<TxResponse, ClientError> {
        self.check(ChainOp::CommitPubRand)?;
        if req.signature.is_empty() {
            return Err(ClientError::Unrecoverable("invalid commitment signature".to_string()));
        }

        let mut state = self.state.write();
        if state.status(&req.fp_pk).slashed {
            return Err(ClientError::Unrecoverable(format!(
                "finality provider {} is slashed",
                req.fp_pk
            )));
        }
        if let Some(activation) = state.activation_height {
            if req.start_height < activation {
                return Err(ClientError::Unrecoverable(format!(
                    "start height {} is below the finality activation height {activation}",
                    req.start_height
                )));
            }
        }
        if let Some(last) = state.commits.get(&req.fp_pk).and_then(|c| c.last()) {
            if req.start_height <= last.end_height() {
                return Err(ClientError::Unrecoverable(format!(
                    "overlapping public randomness commitment: start {} <= last committed {}",
                    req.start_height,
                    last.end_height()
                )));
            }
        }

        let epoch = state.tip() / self.config.epoch_length.max(1);
        let commitment = PubRandCommitment::new(
            req.start_height,
            req.num_pub_rand,
            req.commitment,
            req.interval,
            epoch,
        )
        .map_err(|e| ClientError::Unrecoverable(e.to_string()))?;

        info!(
            target: "fpd::devnet",
            fp_pk = %req.fp_pk,
            start_height = commitment.start_height,
            end_height = commitment.end_height(),
            "Recorded public randomness commitment"
        );
        state.commits.entry(req.fp_pk).or_default().push(commitment);
        let tx_hash = state.next_tx_hash();
        Ok(TxResponse { tx_hash, events: vec!["commit_pub_rand".to_string()] })
    }

    async fn submit_batch_finality_sigs(
        &self,
        req: SubmitFinalitySigsRequest,
    ) -> Result<TxResponse, ClientError> {
        self.check(ChainOp::SubmitFinalitySigs)?;
        if req.votes.is_empty() {
            return Err(ClientError::Unrecoverable("empty finality signature batch".to_string()));
        }

        let mut state = self.state.write();
        let fp_pk = req.fp_pk;
        let status = state.status(&fp_pk);
        if status.slashed {
            return Err(ClientError::Unrecoverable(format!("finality provider {fp_pk} is slashed")));
        }
        if status.jailed {
            return Err(ClientError::Unrecoverable(format!("finality provider {fp_pk} is jailed")));
        }

        let mut accepted = Vec::with_capacity(req.votes.len());
        let mut equivocation = None;
        for vote in &req.votes {
            let height = vote.block.height;
            match state.block(height) {
                Some(block) if block.hash == vote.block.hash => {}
                _ => {
                    return Err(ClientError::Unrecoverable(format!(
                        "block {height} not found or hash mismatch"
                    )));
                }
            }
            let Some(commit) = state.commitment_at(&fp_pk, height) else {
                return Err(ClientError::Unrecoverable(format!(
                    "no public randomness commitment covers height {height}"
                )));
            };
            if !state.has_power(&fp_pk, height) {
                return Err(ClientError::Unrecoverable(format!(
                    "finality provider has no voting power at height {height}"
                )));
            }
            let expected_index = (height - commit.start_height) / commit.interval;
            if vote.proof.index != expected_index || vote.proof.total != commit.num_pub_rand {
                return Err(ClientError::Unrecoverable(format!(
                    "public randomness proof at height {height} has wrong position"
                )));
            }
            vote.proof.verify(&commit.commitment, vote.pub_rand.as_slice()).map_err(|e| {
                ClientError::Unrecoverable(format!(
                    "invalid public randomness inclusion proof at height {height}: {e}"
                ))
            })?;

            match state.votes.get(&fp_pk).and_then(|v| v.get(&height)) {
                Some(existing) if *existing == vote.signature => {}
                Some(_) => {
                    equivocation = Some(height);
                    break;
                }
                None => accepted.push((height, vote.signature)),
            }
        }

        if let Some(height) = equivocation {
            warn!(target: "fpd::devnet", %fp_pk, height, "Equivocation detected, slashing");
            state.statuses.entry(fp_pk).or_default().slashed = true;
            return Err(ClientError::Unrecoverable(format!(
                "equivocation at height {height}: finality provider {fp_pk} slashed"
            )));
        }
        if accepted.is_empty() {
            return Err(ClientError::Expected("duplicated finality vote".to_string()));
        }

        let mut events = Vec::with_capacity(accepted.len());
        for (height, signature) in accepted {
            state.votes.entry(fp_pk).or_default().insert(height, signature);
            if let Some(block) = state.blocks.get_mut((height - 1) as usize) {
                block.finalized = true;
            }
            events.push(format!("finality_vote:{height}"));
        }
        debug!(target: "fpd::devnet", %fp_pk, votes = events.len(), "Accepted finality votes");

        let tx_hash = state.next_tx_hash();
        Ok(TxResponse { tx_hash, events })
    }

    fn finality_sig_context(&self) -> String {
        self.context("fp_finality_vote")
    }

    fn pub_rand_commit_context(&self) -> String {
        self.context("fp_rand_commit")
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Spawn a task appending one block every `block_time` until `shutdown`
pub fn spawn_block_producer(
    chain: Arc<SimulatedChain>,
    block_time: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(block_time.max(Duration::from_millis(1)));
        // First tick completes immediately
        ticker.tick().await;

        info!(
            target: "fpd::devnet",
            chain_id = chain.chain_id(),
            block_time_ms = block_time.as_millis() as u64,
            "Block producer started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let block = chain.produce_block();
                    debug!(target: "fpd::devnet", height = block.height, "Produced block");
                }
            }
        }
        info!(target: "fpd::devnet", "Block producer stopped");
    })
}
