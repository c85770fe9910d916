//! Supervisor of the finality provider instance

use fpd_clients::{ConsumerController, EotsManager, ProviderStore, PubRandProofStore, StoreError};
use fpd_types::{BtcPublicKey, ProviderStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    CriticalCause, CriticalError, FinalityProviderInstance, FpdConfig, InstanceError, ProviderInfo,
    ProviderStateHandle,
};

/// Manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Only one instance runs per process
    #[error("finality provider {0} is already running")]
    AlreadyRunning(BtcPublicKey),

    /// No instance is running
    #[error("no finality provider is running")]
    NotRunning,

    /// Jailed and slashed providers do not start
    #[error("finality provider {fp_pk} is {status}")]
    Terminal {
        /// Provider public key
        fp_pk: BtcPublicKey,
        /// Its status
        status: ProviderStatus,
    },

    /// The provider is registered for another chain
    #[error("finality provider is registered on {got}, daemon runs {expected}")]
    ChainMismatch {
        /// Configured chain id
        expected: String,
        /// Chain id in the provider record
        got: String,
    },

    /// Provider store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Instance failure
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Conditions that must end the daemon
#[derive(Debug, Error)]
pub enum FatalError {
    /// An instance hit an error it cannot recover from
    #[error("critical error: {0}")]
    Critical(CriticalError),

    /// A terminal status could not be persisted
    #[error("failed to persist status {status} for finality provider {fp_pk}: {source}")]
    Persist {
        /// Provider public key
        fp_pk: BtcPublicKey,
        /// Status that was being written
        status: ProviderStatus,
        /// Store error
        source: StoreError,
    },

    /// `run` was called twice
    #[error("provider manager is already running")]
    AlreadyRunning,
}

/// Starts and stops the finality provider instance, handles its critical
/// errors and keeps the provider status in sync with the chain.
#[derive(Debug)]
pub struct ProviderManager {
    config: FpdConfig,
    client: Arc<dyn ConsumerController>,
    eots: Arc<dyn EotsManager>,
    provider_store: Arc<dyn ProviderStore>,
    proof_store: Arc<dyn PubRandProofStore>,
    shutdown: CancellationToken,
    critical_tx: mpsc::Sender<CriticalError>,
    critical_rx: Mutex<Option<mpsc::Receiver<CriticalError>>>,
    instance: tokio::sync::Mutex<Option<Arc<FinalityProviderInstance>>>,
}

impl ProviderManager {
    /// Create a manager with no running instance
    pub fn new(
        config: FpdConfig,
        client: Arc<dyn ConsumerController>,
        eots: Arc<dyn EotsManager>,
        provider_store: Arc<dyn ProviderStore>,
        proof_store: Arc<dyn PubRandProofStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let (critical_tx, critical_rx) = mpsc::channel(1);
        Self {
            config,
            client,
            eots,
            provider_store,
            proof_store,
            shutdown,
            critical_tx,
            critical_rx: Mutex::new(Some(critical_rx)),
            instance: tokio::sync::Mutex::new(None),
        }
    }

    /// Start an instance for the stored provider `fp_pk`
    pub async fn start_finality_provider(&self, fp_pk: BtcPublicKey) -> Result<(), ManagerError> {
        let mut slot = self.instance.lock().await;
        if let Some(running) = slot.as_ref().filter(|i| i.is_running()) {
            return Err(ManagerError::AlreadyRunning(running.btc_pk()));
        }

        let state = ProviderStateHandle::load(Arc::clone(&self.provider_store), &fp_pk)?;
        let status = state.status();
        if status.is_terminal() {
            return Err(ManagerError::Terminal { fp_pk, status });
        }
        let chain_id = state.chain_id();
        if chain_id != self.config.chain_id {
            return Err(ManagerError::ChainMismatch {
                expected: self.config.chain_id.clone(),
                got: chain_id,
            });
        }

        let instance = Arc::new(FinalityProviderInstance::new(
            self.config.clone(),
            state,
            Arc::clone(&self.client),
            Arc::clone(&self.eots),
            Arc::clone(&self.proof_store),
            self.critical_tx.clone(),
            &self.shutdown,
        )?);
        instance.start().await?;
        *slot = Some(instance);

        info!(target: "fpd::manager", %fp_pk, "Finality provider started");
        Ok(())
    }

    /// Stop the running instance
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let instance = self.instance.lock().await.take().ok_or(ManagerError::NotRunning)?;
        instance.stop().await?;
        info!(target: "fpd::manager", fp_pk = %instance.btc_pk(), "Finality provider stopped");
        Ok(())
    }

    /// The running instance, if any
    pub async fn running_instance(&self) -> Option<Arc<FinalityProviderInstance>> {
        self.instance.lock().await.as_ref().filter(|i| i.is_running()).cloned()
    }

    /// Info of `fp_pk`, live when it is running
    pub async fn provider_info(&self, fp_pk: &BtcPublicKey) -> Result<ProviderInfo, ManagerError> {
        if let Some(instance) = self.running_instance().await {
            if instance.btc_pk() == *fp_pk {
                return Ok(instance.provider_info());
            }
        }
        let state = self.provider_store.get_provider(fp_pk)?;
        Ok(ProviderInfo {
            btc_pk: state.btc_pk,
            chain_id: state.chain_id,
            status: state.status,
            last_voted_height: state.last_voted_height,
            is_running: false,
        })
    }

    /// Supervise until shutdown or a fatal error.
    ///
    /// Jailed and slashed providers are recorded and stopped; the daemon
    /// keeps running. Any other critical error stops the instance and is
    /// returned.
    pub async fn run(&self) -> Result<(), FatalError> {
        let mut critical_rx = self.critical_rx.lock().take().ok_or(FatalError::AlreadyRunning)?;
        let mut ticker = tokio::time::interval(self.config.status_update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let res = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                Some(err) = critical_rx.recv() => {
                    if let Err(fatal) = self.handle_critical(err).await {
                        break Err(fatal);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(fatal) = self.sync_status().await {
                        break Err(fatal);
                    }
                }
            }
        };

        match self.stop().await {
            Ok(()) | Err(ManagerError::NotRunning) => {}
            Err(e) => warn!(target: "fpd::manager", error = %e, "Failed to stop finality provider"),
        }
        res
    }

    async fn handle_critical(&self, err: CriticalError) -> Result<(), FatalError> {
        let status = match &err.cause {
            CriticalCause::Jailed => ProviderStatus::Jailed,
            CriticalCause::Slashed => ProviderStatus::Slashed,
            CriticalCause::Fatal(_) => {
                error!(target: "fpd::manager", error = %err, "Unrecoverable finality provider error");
                if let Err(e) = self.stop().await {
                    debug!(target: "fpd::manager", error = %e, "Stop after critical error");
                }
                return Err(FatalError::Critical(err));
            }
        };

        let fp_pk = err.fp_pk;
        warn!(target: "fpd::manager", %fp_pk, %status, "Finality provider lost its duties");
        self.persist_status(fp_pk, status).await?;

        let running = self.running_instance().await.is_some_and(|i| i.btc_pk() == fp_pk);
        if running {
            if let Err(e) = self.stop().await {
                warn!(target: "fpd::manager", error = %e, "Failed to stop finality provider");
            }
        }
        Ok(())
    }

    async fn persist_status(
        &self,
        fp_pk: BtcPublicKey,
        status: ProviderStatus,
    ) -> Result<(), FatalError> {
        let state = match self.running_instance().await.filter(|i| i.btc_pk() == fp_pk) {
            Some(instance) => instance.state().clone(),
            None => ProviderStateHandle::load(Arc::clone(&self.provider_store), &fp_pk)
                .map_err(|source| FatalError::Persist { fp_pk, status, source })?,
        };
        match state.set_status(status) {
            Ok(_) => Ok(()),
            // Already slashed while being jailed
            Err(StoreError::InvalidTransition { from: ProviderStatus::Slashed, .. }) => Ok(()),
            Err(source) => Err(FatalError::Persist { fp_pk, status, source }),
        }
    }

    /// Align the running provider's status with the chain
    async fn sync_status(&self) -> Result<(), FatalError> {
        let Some(instance) = self.running_instance().await else {
            return Ok(());
        };
        let fp_pk = instance.btc_pk();

        let chain_status = match self.client.query_provider_status(fp_pk).await {
            Ok(status) => status,
            Err(e) => {
                debug!(target: "fpd::manager", error = %e, "Status sync skipped");
                return Ok(());
            }
        };
        if chain_status.slashed {
            return self
                .handle_critical(CriticalError { fp_pk, cause: CriticalCause::Slashed })
                .await;
        }
        if chain_status.jailed {
            return self.handle_critical(CriticalError { fp_pk, cause: CriticalCause::Jailed }).await;
        }

        let has_power = match self.client.query_latest_block().await {
            Ok(tip) => self.client.query_has_voting_power(fp_pk, tip.height).await,
            Err(e) => Err(e),
        };
        let has_power = match has_power {
            Ok(has_power) => has_power,
            Err(e) => {
                debug!(target: "fpd::manager", error = %e, "Voting power check skipped");
                return Ok(());
            }
        };

        let state = instance.state();
        let next = match (has_power, state.status()) {
            (true, status) if status != ProviderStatus::Active => Some(ProviderStatus::Active),
            (false, ProviderStatus::Active) => Some(ProviderStatus::Inactive),
            _ => None,
        };
        if let Some(status) = next {
            if let Err(e) = state.set_status(status) {
                warn!(target: "fpd::manager", %fp_pk, error = %e, "Failed to update status");
            }
        }
        Ok(())
    }
}
