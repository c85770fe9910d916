//! Lifecycle of one running finality provider

use fpd_clients::{ClientError, ConsumerController, EotsManager, PubRandProofStore, TxResponse};
use fpd_poller::{ChainPoller, PollerError};
use fpd_types::{
    BlockDescriptor, BtcPublicKey, ProviderStatus,
    retry::{RetryError, retry_with_shutdown, sleep_or_shutdown},
};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    CommitError, DefaultRandomnessCommitter, DenseRandomness, DetermineError,
    FinalitySubmissionStrategy, FinalitySubmitter, FpdConfig, IntervalRandomness,
    IntervalRandomnessCommitter, ProviderStateHandle, RandomnessCommitter, StartHeightDeterminer,
    SubmitError, submitter::SubmitterConfig,
};

/// Why an instance cannot keep running
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriticalCause {
    /// The chain jailed the provider
    #[error("finality provider is jailed")]
    Jailed,
    /// The chain slashed the provider
    #[error("finality provider is slashed")]
    Slashed,
    /// Anything else the instance cannot recover from
    #[error("{0}")]
    Fatal(String),
}

/// Condition reported to the manager over the critical-error channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("finality provider {fp_pk}: {cause}")]
pub struct CriticalError {
    /// Provider the error belongs to
    pub fp_pk: BtcPublicKey,
    /// What happened
    pub cause: CriticalCause,
}

/// Fast sync errors
#[derive(Debug, Error)]
pub enum FastSyncError {
    /// Nothing to sync: the start is past the target
    #[error("invalid fast sync range: start {start} is above target {target}")]
    InvalidRange {
        /// First height that would be synced
        start: u64,
        /// Requested target
        target: u64,
    },

    /// A chain query kept failing
    #[error("fast sync query failed: {0}")]
    Query(ClientError),

    /// Shutdown was requested
    #[error("fast sync cancelled")]
    Cancelled,

    /// Submitting the catch-up votes failed
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl From<RetryError<ClientError>> for FastSyncError {
    fn from(err: RetryError<ClientError>) -> Self {
        match err {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Failed(e) => Self::Query(e),
        }
    }
}

/// Outcome of a fast sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastSyncResult {
    /// Highest block the sync went through
    pub synced_height: u64,
    /// Last processed height of the instance afterwards
    pub last_processed_height: u64,
    /// One response per submitted batch
    pub responses: Vec<TxResponse>,
}

/// Instance errors
#[derive(Debug, Error)]
pub enum InstanceError {
    /// `start` was already called on this instance
    #[error("finality provider instance was already started")]
    AlreadyStarted,

    /// The instance is not running
    #[error("finality provider instance is not running")]
    NotRunning,

    /// Jailed and slashed providers do not start
    #[error("finality provider is {0}, refusing to start")]
    Terminal(ProviderStatus),

    /// The chain tip could not be queried
    #[error("failed to query the chain tip: {0}")]
    Query(ClientError),

    /// Shutdown was requested during bootstrap
    #[error("bootstrap cancelled")]
    Cancelled,

    /// Start height resolution failed
    #[error(transparent)]
    Determine(#[from] DetermineError),

    /// Bootstrap fast sync failed
    #[error(transparent)]
    FastSync(#[from] FastSyncError),

    /// Poller failure
    #[error(transparent)]
    Poller(#[from] PollerError),

    /// Randomness commitment failure
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// Finality vote failure
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Point-in-time view of a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Provider public key
    pub btc_pk: BtcPublicKey,
    /// Consumer chain id
    pub chain_id: String,
    /// Current status
    pub status: ProviderStatus,
    /// Highest height a vote was submitted for
    pub last_voted_height: u64,
    /// Whether an instance is running for the provider
    pub is_running: bool,
}

/// Runs one finality provider: the block poller plus the submission,
/// randomness and lag detection loops.
///
/// An instance is started at most once. Stopping it closes the chain
/// connection through the poller; run a new instance to resume.
#[derive(Debug)]
pub struct FinalityProviderInstance {
    inner: Arc<Inner>,
    started: AtomicBool,
    tasks: Mutex<Option<JoinSet<()>>>,
}

#[derive(Debug)]
struct Inner {
    config: FpdConfig,
    state: ProviderStateHandle,
    client: Arc<dyn ConsumerController>,
    poller: ChainPoller,
    committer: Arc<dyn RandomnessCommitter>,
    submitter: FinalitySubmitter,
    critical_tx: mpsc::Sender<CriticalError>,
    last_processed: AtomicU64,
    lagging: AtomicBool,
    shutdown: CancellationToken,
}

impl FinalityProviderInstance {
    /// Assemble an instance for the provider in `state`.
    ///
    /// `finality_vote_interval` in `config` selects sparse randomness.
    pub fn new(
        config: FpdConfig,
        state: ProviderStateHandle,
        client: Arc<dyn ConsumerController>,
        eots: Arc<dyn EotsManager>,
        proof_store: Arc<dyn PubRandProofStore>,
        critical_tx: mpsc::Sender<CriticalError>,
        parent_shutdown: &CancellationToken,
    ) -> Result<Self, InstanceError> {
        let shutdown = parent_shutdown.child_token();
        let dense = DefaultRandomnessCommitter::new(
            state.btc_pk(),
            &config,
            Arc::clone(&client),
            Arc::clone(&eots),
            proof_store,
        );

        let committer: Arc<dyn RandomnessCommitter> = match config.finality_vote_interval {
            Some(interval) => Arc::new(IntervalRandomnessCommitter::new(dense, interval)?),
            None => Arc::new(dense),
        };
        let strategy: Arc<dyn FinalitySubmissionStrategy> =
            if config.finality_vote_interval.is_some() {
                Arc::new(IntervalRandomness::new(Arc::clone(&eots), Arc::clone(&committer)))
            } else {
                Arc::new(DenseRandomness::new(Arc::clone(&eots), Arc::clone(&committer)))
            };

        let submitter = FinalitySubmitter::new(
            SubmitterConfig::from(&config),
            Arc::clone(&client),
            eots,
            strategy,
            shutdown.clone(),
        );
        submitter.init_state(state.clone())?;
        let poller = ChainPoller::new(config.poller.clone(), Arc::clone(&client));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state,
                client,
                poller,
                committer,
                submitter,
                critical_tx,
                last_processed: AtomicU64::new(0),
                lagging: AtomicBool::new(false),
                shutdown,
            }),
            started: AtomicBool::new(false),
            tasks: Mutex::new(None),
        })
    }

    /// Provider public key
    pub fn btc_pk(&self) -> BtcPublicKey {
        self.inner.state.btc_pk()
    }

    /// Shared provider state
    pub fn state(&self) -> &ProviderStateHandle {
        &self.inner.state
    }

    /// Highest height handled by the submission loop or fast sync
    pub fn last_processed_height(&self) -> u64 {
        self.inner.last_processed()
    }

    /// Whether the loops are running
    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some() && !self.inner.shutdown.is_cancelled()
    }

    /// Current provider info
    pub fn provider_info(&self) -> ProviderInfo {
        let state = self.inner.state.snapshot();
        ProviderInfo {
            btc_pk: state.btc_pk,
            chain_id: state.chain_id,
            status: state.status,
            last_voted_height: state.last_voted_height,
            is_running: self.is_running(),
        }
    }

    /// Bootstrap and launch the loops.
    ///
    /// Bootstrap resolves the start height and, when the chain is more than
    /// `fast_sync_gap` blocks ahead, catches up before polling starts.
    pub async fn start(&self) -> Result<(), InstanceError> {
        let status = self.inner.state.status();
        if status.is_terminal() {
            return Err(InstanceError::Terminal(status));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(InstanceError::AlreadyStarted);
        }
        let inner = &self.inner;
        let fp_pk = inner.state.btc_pk();

        let determiner = StartHeightDeterminer::new(
            Arc::clone(&inner.client),
            inner.config.start_height_mode(),
            inner.config.query_retry,
            inner.shutdown.clone(),
        );
        let state = inner.state.clone();
        let start_height =
            determiner.determine_start_height(fp_pk, move || state.last_voted_height()).await?;
        inner.last_processed.store(start_height.saturating_sub(1), Ordering::SeqCst);

        let tip = retry_with_shutdown(
            &inner.config.query_retry,
            &inner.shutdown,
            "query_latest_block",
            || inner.client.query_latest_block(),
        )
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => InstanceError::Cancelled,
            RetryError::Failed(e) => InstanceError::Query(e),
        })?
        .height;

        if inner.is_lagging_behind(tip) {
            match inner.fast_sync(tip).await {
                Ok(res) => info!(
                    target: "fpd::instance",
                    %fp_pk,
                    synced_height = res.synced_height,
                    batches = res.responses.len(),
                    "Bootstrap fast sync done"
                ),
                Err(FastSyncError::InvalidRange { start, target }) => {
                    debug!(target: "fpd::instance", start, target, "Nothing to fast sync");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let (Some(blocks), Some(poller_fatal)) =
            (inner.poller.take_block_receiver(), inner.poller.take_fatal_receiver())
        else {
            return Err(InstanceError::AlreadyStarted);
        };
        inner.poller.start(inner.last_processed() + 1, &inner.shutdown)?;

        let (lag_tx, lag_rx) = mpsc::channel(1);
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(inner).submission_loop(blocks, lag_rx, poller_fatal));
        tasks.spawn(Arc::clone(inner).randomness_loop());
        tasks.spawn(Arc::clone(inner).lag_detection_loop(lag_tx));
        *self.tasks.lock() = Some(tasks);

        info!(
            target: "fpd::instance",
            %fp_pk,
            start_height,
            poll_from = inner.last_processed() + 1,
            "Finality provider instance started"
        );
        Ok(())
    }

    /// Stop the poller, then wait for the loops to exit
    pub async fn stop(&self) -> Result<(), InstanceError> {
        let Some(mut tasks) = self.tasks.lock().take() else {
            return Err(InstanceError::NotRunning);
        };

        self.inner.shutdown.cancel();
        let poller = self.inner.poller.stop().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(target: "fpd::instance", error = %e, "Instance task failed");
            }
        }

        info!(
            target: "fpd::instance",
            fp_pk = %self.btc_pk(),
            last_processed = self.inner.last_processed(),
            "Finality provider instance stopped"
        );
        match poller {
            Ok(()) | Err(PollerError::NotRunning) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Vote on `[max(last finalized, last processed) + 1, target]` in batches
    pub async fn fast_sync(&self, target: u64) -> Result<FastSyncResult, FastSyncError> {
        self.inner.fast_sync(target).await
    }

    /// Vote on a single block outside the submission loop
    pub async fn submit_finality_signature(
        &self,
        block: BlockDescriptor,
    ) -> Result<Option<TxResponse>, InstanceError> {
        let height = block.height;
        let res = self.inner.submitter.submit_batch_finality_signatures(&[block]).await?;
        self.inner.mark_processed(height);
        Ok(res)
    }

    /// Commit randomness until `target_height` is covered.
    ///
    /// Returns one response per commitment made.
    pub async fn commit_pub_rand_until(
        &self,
        target_height: u64,
    ) -> Result<Vec<TxResponse>, InstanceError> {
        let committer = &self.inner.committer;
        let mut responses = Vec::new();
        loop {
            let start_height = committer.next_start_height().await?;
            if start_height > target_height {
                break;
            }
            match committer.commit(start_height).await? {
                Some(tx) => responses.push(tx),
                // Already committed; the next start height would not move
                None => break,
            }
        }
        Ok(responses)
    }
}

impl Inner {
    fn last_processed(&self) -> u64 {
        self.last_processed.load(Ordering::SeqCst)
    }

    fn mark_processed(&self, height: u64) {
        self.last_processed.fetch_max(height, Ordering::SeqCst);
    }

    fn is_lagging_behind(&self, tip: u64) -> bool {
        let gap = self.config.fast_sync_gap;
        gap > 0 && tip.saturating_sub(self.last_processed()) >= gap
    }

    fn report(&self, cause: CriticalCause) {
        let err = CriticalError { fp_pk: self.state.btc_pk(), cause };
        error!(target: "fpd::instance", error = %err, "Critical error");
        match self.critical_tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                warn!(target: "fpd::instance", error = %err, "Critical error dropped, one is pending");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: "fpd::instance", "Critical error channel closed");
            }
        }
    }

    /// `None` for errors that leave the block to a later retry
    fn critical_cause(err: &SubmitError) -> Option<CriticalCause> {
        match err {
            SubmitError::Jailed => Some(CriticalCause::Jailed),
            SubmitError::Slashed => Some(CriticalCause::Slashed),
            SubmitError::Query(_) => None,
            other => Some(CriticalCause::Fatal(other.to_string())),
        }
    }

    async fn submission_loop(
        self: Arc<Self>,
        mut blocks: mpsc::Receiver<BlockDescriptor>,
        mut lag_rx: mpsc::Receiver<BlockDescriptor>,
        mut poller_fatal: mpsc::Receiver<PollerError>,
    ) {
        loop {
            let keep_going = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => false,
                Some(err) = poller_fatal.recv() => {
                    self.report(CriticalCause::Fatal(err.to_string()));
                    false
                }
                Some(tip) = lag_rx.recv() => self.catch_up(tip.height).await,
                block = blocks.recv() => match block {
                    Some(block) => self.process_block(block).await,
                    None => false,
                },
            };
            if !keep_going {
                break;
            }
        }
        debug!(target: "fpd::instance", "Submission loop exited");
    }

    /// Returns `false` once the loop must stop
    async fn process_block(&self, block: BlockDescriptor) -> bool {
        let height = block.height;
        if height <= self.last_processed() {
            debug!(target: "fpd::instance", height, "Block already processed, skipping");
            return true;
        }

        // Blocks without voting power are filtered out by the submitter
        match self.submitter.submit_batch_finality_signatures(std::slice::from_ref(&block)).await
        {
            Ok(_) => {
                self.mark_processed(height);
                true
            }
            Err(e) => match Self::critical_cause(&e) {
                Some(cause) => {
                    self.report(cause);
                    false
                }
                None => {
                    warn!(
                        target: "fpd::instance",
                        height,
                        error = %e,
                        "Failed to process block, leaving it to fast sync"
                    );
                    true
                }
            },
        }
    }

    /// Fast sync to `target` and move the poller past it
    async fn catch_up(&self, target: u64) -> bool {
        let keep_going = match self.fast_sync(target).await {
            Ok(res) => {
                info!(
                    target: "fpd::instance",
                    synced_height = res.synced_height,
                    batches = res.responses.len(),
                    "Caught up with the chain"
                );
                match self.poller.skip_to_height(res.last_processed_height + 1) {
                    Ok(()) | Err(PollerError::SkipBelowNext { .. }) => {}
                    Err(e) => warn!(target: "fpd::instance", error = %e, "Poller skip failed"),
                }
                true
            }
            Err(FastSyncError::InvalidRange { start, target }) => {
                debug!(target: "fpd::instance", start, target, "Already caught up");
                true
            }
            Err(FastSyncError::Cancelled) => false,
            Err(FastSyncError::Query(e)) => {
                warn!(target: "fpd::instance", target, error = %e, "Fast sync query failed");
                true
            }
            Err(FastSyncError::Submit(e)) => match Self::critical_cause(&e) {
                Some(cause) => {
                    self.report(cause);
                    false
                }
                None => {
                    warn!(target: "fpd::instance", target, error = %e, "Fast sync submission failed");
                    true
                }
            },
        };
        self.lagging.store(false, Ordering::SeqCst);
        keep_going
    }

    async fn fast_sync(&self, target: u64) -> Result<FastSyncResult, FastSyncError> {
        let last_finalized = retry_with_shutdown(
            &self.config.query_retry,
            &self.shutdown,
            "query_latest_finalized_block",
            || self.client.query_latest_finalized_block(),
        )
        .await?
        .map_or(0, |block| block.height);

        let start = last_finalized.max(self.last_processed()) + 1;
        if start > target {
            return Err(FastSyncError::InvalidRange { start, target });
        }
        info!(target: "fpd::instance", start, target, "Fast sync started");

        let page = self.config.fast_sync_limit.max(1);
        let batch = usize::try_from(self.config.batch_submission_size.max(1)).unwrap_or(usize::MAX);
        let mut responses = Vec::new();
        let mut next = start;
        let mut synced_height = start - 1;

        while next <= target {
            let end = target.min(next.saturating_add(page - 1));
            let blocks = retry_with_shutdown(
                &self.config.query_retry,
                &self.shutdown,
                "query_blocks",
                || self.client.query_blocks(next, end, page),
            )
            .await?;
            let Some(last) = blocks.last().map(|b| b.height) else {
                break;
            };

            for chunk in blocks.chunks(batch) {
                if let Some(tx) = self.submitter.submit_batch_finality_signatures(chunk).await? {
                    responses.push(tx);
                }
            }
            synced_height = last;
            self.mark_processed(last);
            next = last + 1;
        }

        Ok(FastSyncResult { synced_height, last_processed_height: self.last_processed(), responses })
    }

    async fn randomness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.randomness_commit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(cause) = self.commit_randomness().await {
                        self.report(cause);
                        break;
                    }
                }
            }
        }
        debug!(target: "fpd::instance", "Randomness loop exited");
    }

    /// One randomness round, retried until it lands or is moot
    async fn commit_randomness(&self) -> Result<(), CriticalCause> {
        let decision = match self.committer.should_commit().await {
            Ok(Some(decision)) => decision,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(target: "fpd::instance", error = %e, "Failed to check randomness commitment");
                return Ok(());
            }
        };

        let max_attempts = self.config.max_submission_retries;
        let mut failures = 0u32;
        loop {
            let err = match self.committer.commit(decision.start_height).await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            if let CommitError::Client(client_err) = &err {
                if client_err.mentions("slashed") {
                    return Err(CriticalCause::Slashed);
                }
                if client_err.mentions("jailed") {
                    return Err(CriticalCause::Jailed);
                }
            }

            failures += 1;
            warn!(
                target: "fpd::instance",
                start_height = decision.start_height,
                failures,
                max_attempts,
                error = %err,
                "Randomness commitment failed"
            );
            if failures >= max_attempts {
                return Err(CriticalCause::Fatal(format!(
                    "failed to commit public randomness after {failures} attempts: {err}"
                )));
            }

            if self.client.query_is_block_finalized(decision.tip_height).await == Ok(true) {
                info!(
                    target: "fpd::instance",
                    tip_height = decision.tip_height,
                    "Target block finalized, dropping randomness commitment"
                );
                return Ok(());
            }
            if !sleep_or_shutdown(self.config.submission_retry_interval, &self.shutdown).await {
                return Ok(());
            }
        }
    }

    async fn lag_detection_loop(self: Arc<Self>, lag_tx: mpsc::Sender<BlockDescriptor>) {
        if self.config.fast_sync_gap == 0 {
            debug!(target: "fpd::instance", "Lag detection disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.fast_sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.lagging.load(Ordering::SeqCst) {
                        continue;
                    }
                    let tip = match self.client.query_latest_block().await {
                        Ok(tip) => tip,
                        Err(e) => {
                            debug!(target: "fpd::instance", error = %e, "Lag check skipped");
                            continue;
                        }
                    };
                    if !self.is_lagging_behind(tip.height) {
                        continue;
                    }

                    self.lagging.store(true, Ordering::SeqCst);
                    info!(
                        target: "fpd::instance",
                        tip = tip.height,
                        last_processed = self.last_processed(),
                        "Falling behind the chain, requesting fast sync"
                    );
                    match lag_tx.try_send(tip) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
        debug!(target: "fpd::instance", "Lag detection loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;
    use assert_matches::assert_matches;
    use fpd_clients::ProviderStore;
    use fpd_devnet::ChainOp;
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_refused_when_terminal() {
        let h = Harness::new(1, 10);
        h.providers.set_status(&h.pk, ProviderStatus::Jailed).unwrap();
        let (instance, _critical) = h.instance();
        assert_matches!(
            instance.start().await,
            Err(InstanceError::Terminal(ProviderStatus::Jailed))
        );
        assert!(!instance.is_running());
    }

    #[tokio::test]
    async fn test_start_once() {
        let h = Harness::new(1, 2);
        let (instance, _critical) = h.instance();
        instance.start().await.unwrap();
        assert!(instance.is_running());
        assert_matches!(instance.start().await, Err(InstanceError::AlreadyStarted));

        instance.stop().await.unwrap();
        assert!(!instance.is_running());
        assert!(h.chain.is_closed());
        assert_matches!(instance.stop().await, Err(InstanceError::NotRunning));
    }

    #[tokio::test]
    async fn test_fast_sync_rejects_empty_range() {
        let h = Harness::new(1, 10);
        h.chain.finalize(8);
        let (instance, _critical) = h.instance();
        assert_matches!(
            instance.fast_sync(5).await,
            Err(FastSyncError::InvalidRange { start: 9, target: 5 })
        );
    }

    #[tokio::test]
    async fn test_fast_sync_votes_in_batches() {
        let mut h = Harness::new(1, 12);
        h.config.num_pub_rand = 20;
        h.config.batch_submission_size = 4;
        h.config.fast_sync_limit = 5;
        let (instance, _critical) = h.instance();

        assert_eq!(instance.commit_pub_rand_until(12).await.unwrap().len(), 1);
        let res = instance.fast_sync(10).await.unwrap();

        assert_eq!(res.synced_height, 10);
        assert_eq!(res.last_processed_height, 10);
        // Pages 1..=5 and 6..=10, each split into chunks of 4 and 1
        assert_eq!(res.responses.len(), 4);
        assert_eq!(h.chain.votes(&h.pk).len(), 10);
        assert_eq!(instance.state().last_voted_height(), 10);
    }

    #[tokio::test]
    async fn test_commit_pub_rand_until_covers_target() {
        let h = Harness::new(5, 5);
        let (instance, _critical) = h.instance();

        // Batches of 3 from the activation height: 5..=7, 8..=10, 11..=13
        let responses = instance.commit_pub_rand_until(12).await.unwrap();
        assert_eq!(responses.len(), 3);
        let commits = h.chain.commitments(&h.pk);
        assert_eq!(commits.last().map(|c| c.end_height()), Some(13));
        assert!(instance.commit_pub_rand_until(13).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_finality_signature_marks_processed() {
        let h = Harness::new(1, 10);
        let (instance, _critical) = h.instance();
        instance.commit_pub_rand_until(3).await.unwrap();

        instance.submit_finality_signature(h.block(2)).await.unwrap().unwrap();
        assert_eq!(instance.last_processed_height(), 2);
        assert_eq!(instance.provider_info().last_voted_height, 2);
        assert_eq!(instance.provider_info().status, ProviderStatus::Active);
    }

    #[tokio::test]
    async fn test_votes_new_blocks_and_reports_jail() {
        let h = Harness::new(1, 1);
        let (instance, mut critical) = h.instance();
        // Far enough ahead that the randomness loop stays idle
        instance.commit_pub_rand_until(10).await.unwrap();
        instance.start().await.unwrap();

        h.chain.produce_blocks(2);
        tokio::time::timeout(Duration::from_secs(5), async {
            while instance.state().last_voted_height() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        h.chain.jail(h.pk);
        h.chain.produce_block();
        let err = tokio::time::timeout(Duration::from_secs(5), critical.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err, CriticalError { fp_pk: h.pk, cause: CriticalCause::Jailed });

        instance.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lag_catch_up_with_full_block_queue() {
        let mut h = Harness::new(1, 1);
        h.config.num_pub_rand = 100;
        h.config.fast_sync_gap = 3;
        h.config.submission_retry_interval = Duration::from_millis(200);
        h.config.poller.buffer_size = 2;
        let (instance, mut critical) = h.instance();
        instance.commit_pub_rand_until(1).await.unwrap();
        instance.start().await.unwrap();

        h.chain.produce_block();
        wait_until(|| instance.state().last_voted_height() >= 2).await;

        // The vote on 3 stalls while the poller fills the queue and blocks on it
        h.chain.inject_failures(
            ChainOp::SubmitFinalitySigs,
            ClientError::Transient("timeout".into()),
            2,
        );
        let tip = h.chain.produce_blocks(20);
        wait_until(|| instance.last_processed_height() >= tip).await;
        wait_until(|| instance.inner.poller.next_height() > tip).await;

        // Polling resumes past the skipped range
        let tip = h.chain.produce_blocks(5);
        wait_until(|| instance.state().last_voted_height() >= tip).await;
        assert_eq!(
            h.chain.votes(&h.pk).keys().copied().collect::<Vec<_>>(),
            (1..=tip).collect::<Vec<_>>()
        );
        assert!(critical.try_recv().is_err());

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_voting_power_query_failure_leaves_block_to_fast_sync() {
        let h = Harness::new(1, 5);
        let (instance, mut critical) = h.instance();
        instance.commit_pub_rand_until(5).await.unwrap();

        // One failure per attempt of the query retry policy
        h.chain.inject_failures(
            ChainOp::VotingPower,
            ClientError::Transient("timeout".into()),
            h.config.query_retry.max_attempts as usize,
        );
        assert!(instance.inner.process_block(h.block(2)).await);
        assert_eq!(instance.last_processed_height(), 0);
        assert!(h.chain.votes(&h.pk).is_empty());
        assert!(critical.try_recv().is_err());

        let res = instance.fast_sync(2).await.unwrap();
        assert_eq!(res.last_processed_height, 2);
        assert_eq!(h.chain.votes(&h.pk).keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_randomness_commit_dropped_once_tip_finalized() {
        let mut h = Harness::new(1, 5);
        h.config.max_submission_retries = 2;
        h.chain.finalize(5);
        h.chain.inject_failures(
            ChainOp::CommitPubRand,
            ClientError::Transient("mempool full".into()),
            10,
        );
        let (instance, _critical) = h.instance();

        assert_eq!(instance.inner.commit_randomness().await, Ok(()));
        assert!(h.chain.commitments(&h.pk).is_empty());
    }

    #[tokio::test]
    async fn test_randomness_retries_exhausted_is_fatal() {
        let mut h = Harness::new(1, 5);
        h.config.max_submission_retries = 3;
        h.chain.inject_failures(
            ChainOp::CommitPubRand,
            ClientError::Transient("mempool full".into()),
            100,
        );
        let (instance, mut critical) = h.instance();
        instance.start().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), critical.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err.fp_pk, h.pk);
        assert_matches!(
            err.cause,
            CriticalCause::Fatal(msg) if msg.contains("after 3 attempts")
        );

        instance.stop().await.unwrap();
    }
}
