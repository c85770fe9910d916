use fpd_clients::{ClientError, ConsumerController};
use fpd_types::{
    BlockDescriptor,
    retry::{RetryError, retry_when, sleep_or_shutdown},
};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{MAX_FAILED_CYCLES, PollerConfig};

/// Chain poller errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollerError {
    /// `start` called on a running poller
    #[error("chain poller already started")]
    AlreadyStarted,

    /// The operation needs a running poller
    #[error("chain poller is not running")]
    NotRunning,

    /// Skipping backwards is not allowed
    #[error("cannot skip to height {target}: next height to poll is {next}")]
    SkipBelowNext {
        /// Requested height
        target: u64,
        /// Current cursor
        next: u64,
    },

    /// Too many consecutive polling cycles failed
    #[error("chain poller gave up after {failures} consecutive failed cycles: {last_error}")]
    FailureBudgetExceeded {
        /// Number of failed cycles
        failures: u32,
        /// Error of the last failed cycle
        last_error: String,
    },

    /// Chain client error
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Handles of a running poll loop
struct RunningLoop {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Sequential block poller.
///
/// The block queue and the fatal channel are created once with the poller,
/// so a stopped poller can be restarted without the consumer re-taking its
/// receivers.
pub struct ChainPoller {
    config: PollerConfig,
    client: Arc<dyn ConsumerController>,
    next_height: Arc<AtomicU64>,
    block_tx: mpsc::Sender<BlockDescriptor>,
    block_rx: Mutex<Option<mpsc::Receiver<BlockDescriptor>>>,
    fatal_tx: mpsc::Sender<PollerError>,
    fatal_rx: Mutex<Option<mpsc::Receiver<PollerError>>>,
    running: Mutex<Option<RunningLoop>>,
}

impl std::fmt::Debug for ChainPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainPoller")
            .field("config", &self.config)
            .field("next_height", &self.next_height())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ChainPoller {
    /// Create a stopped poller
    pub fn new(config: PollerConfig, client: Arc<dyn ConsumerController>) -> Self {
        let (block_tx, block_rx) = mpsc::channel(config.buffer_size.max(1));
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        Self {
            config,
            client,
            next_height: Arc::new(AtomicU64::new(0)),
            block_tx,
            block_rx: Mutex::new(Some(block_rx)),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            running: Mutex::new(None),
        }
    }

    /// The ordered block queue. Can be taken once.
    pub fn take_block_receiver(&self) -> Option<mpsc::Receiver<BlockDescriptor>> {
        self.block_rx.lock().take()
    }

    /// Receiver of the poller's fatal error. Can be taken once.
    pub fn take_fatal_receiver(&self) -> Option<mpsc::Receiver<PollerError>> {
        self.fatal_rx.lock().take()
    }

    /// Next height the poller will fetch
    pub fn next_height(&self) -> u64 {
        self.next_height.load(Ordering::SeqCst)
    }

    /// Whether the poll loop is alive
    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|running| !running.task.is_finished())
    }

    /// Start polling from `start_height`.
    ///
    /// The loop first waits for the finality activation height and never
    /// polls below it. It stops when `shutdown` or [`Self::stop`] fires.
    pub fn start(&self, start_height: u64, shutdown: &CancellationToken) -> Result<(), PollerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(PollerError::AlreadyStarted);
        }

        self.next_height.store(start_height, Ordering::SeqCst);
        let shutdown = shutdown.child_token();
        let poll_loop = PollLoop {
            config: self.config.clone(),
            client: Arc::clone(&self.client),
            next_height: Arc::clone(&self.next_height),
            block_tx: self.block_tx.clone(),
            fatal_tx: self.fatal_tx.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(poll_loop.run());

        info!(target: "fpd::poller", start_height, "Chain poller started");
        *running = Some(RunningLoop { shutdown, task });
        Ok(())
    }

    /// Stop the poll loop, wait for it, then close the chain connection
    pub async fn stop(&self) -> Result<(), PollerError> {
        let Some(running) = self.running.lock().take() else {
            return Err(PollerError::NotRunning);
        };

        running.shutdown.cancel();
        if let Err(e) = running.task.await {
            warn!(target: "fpd::poller", error = %e, "Poll loop task failed");
        }
        self.client.close().await?;

        info!(target: "fpd::poller", next_height = self.next_height(), "Chain poller stopped");
        Ok(())
    }

    /// Move the cursor forward to `height`.
    ///
    /// Never waits on the poll loop, so the queue consumer can call it while
    /// the loop is parked on a full queue. Blocks already queued or in flight
    /// below `height` are still delivered; the consumer is expected to drop
    /// heights it has already processed.
    pub fn skip_to_height(&self, height: u64) -> Result<(), PollerError> {
        if self.running.lock().is_none() {
            return Err(PollerError::NotRunning);
        }

        let from = self
            .next_height
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (height >= next).then_some(height)
            })
            .map_err(|next| PollerError::SkipBelowNext { target: height, next })?;
        info!(target: "fpd::poller", from, to = height, "Poller skipped ahead");
        Ok(())
    }
}

enum CycleError {
    Cancelled,
    QueueClosed,
    Query(ClientError),
}

impl From<RetryError<ClientError>> for CycleError {
    fn from(err: RetryError<ClientError>) -> Self {
        match err {
            RetryError::Cancelled => Self::Cancelled,
            RetryError::Failed(e) => Self::Query(e),
        }
    }
}

struct PollLoop {
    config: PollerConfig,
    client: Arc<dyn ConsumerController>,
    next_height: Arc<AtomicU64>,
    block_tx: mpsc::Sender<BlockDescriptor>,
    fatal_tx: mpsc::Sender<PollerError>,
    shutdown: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        let Some(activation_height) = self.wait_for_activation().await else {
            return;
        };
        if self.next_height.fetch_max(activation_height, Ordering::SeqCst) < activation_height {
            info!(
                target: "fpd::poller",
                activation_height,
                "Start height raised to the finality activation height"
            );
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failed_cycles = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => match self.poll_once().await {
                    Ok(()) => failed_cycles = 0,
                    Err(CycleError::Cancelled) => break,
                    Err(CycleError::QueueClosed) => {
                        info!(target: "fpd::poller", "Block queue closed, stopping poll loop");
                        break;
                    }
                    Err(CycleError::Query(err)) => {
                        failed_cycles += 1;
                        warn!(
                            target: "fpd::poller",
                            next_height = self.next_height.load(Ordering::SeqCst),
                            failed_cycles,
                            error = %err,
                            "Polling cycle failed"
                        );
                        if failed_cycles > MAX_FAILED_CYCLES {
                            error!(
                                target: "fpd::poller",
                                failed_cycles,
                                "Chain poller failure budget exceeded"
                            );
                            let _ = self.fatal_tx.try_send(PollerError::FailureBudgetExceeded {
                                failures: failed_cycles,
                                last_error: err.to_string(),
                            });
                            break;
                        }
                    }
                },
            }
        }
        debug!(target: "fpd::poller", "Poll loop exited");
    }

    async fn wait_for_activation(&self) -> Option<u64> {
        loop {
            match self.client.query_activated_height().await {
                Ok(height) => return Some(height),
                Err(e) => {
                    debug!(target: "fpd::poller", error = %e, "Waiting for finality activation");
                }
            }
            if !sleep_or_shutdown(self.config.poll_interval, &self.shutdown).await {
                return None;
            }
        }
    }

    async fn poll_once(&self) -> Result<(), CycleError> {
        let retry = &self.config.retry;
        let retryable = |e: &ClientError| !e.is_unrecoverable();

        let tip = retry_when(
            retry,
            &self.shutdown,
            "query_latest_block",
            || self.client.query_latest_block(),
            retryable,
        )
        .await?
        .height;

        let cursor = self.next_height.load(Ordering::SeqCst);
        if cursor > tip {
            trace!(target: "fpd::poller", cursor, tip, "No new blocks");
            return Ok(());
        }

        let blocks = if cursor == tip {
            let block = retry_when(
                retry,
                &self.shutdown,
                "query_block",
                || self.client.query_block(tip),
                retryable,
            )
            .await?;
            vec![block]
        } else {
            retry_when(
                retry,
                &self.shutdown,
                "query_blocks",
                || self.client.query_blocks(cursor, tip, self.config.poll_size),
                retryable,
            )
            .await?
        };

        let Some(last_height) = blocks.last().map(|b| b.height) else {
            return Ok(());
        };
        // A skip issued while the queries ran may already be further ahead
        self.next_height.fetch_max(last_height + 1, Ordering::SeqCst);
        debug!(
            target: "fpd::poller",
            from = cursor,
            to = last_height,
            tip,
            "Polled blocks"
        );

        for block in blocks {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(CycleError::Cancelled),
                res = self.block_tx.send(block) => res.map_err(|_| CycleError::QueueClosed)?,
            }
        }
        Ok(())
    }
}
