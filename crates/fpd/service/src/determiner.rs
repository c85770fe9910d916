//! Bootstrap start height resolution

use fpd_clients::{ClientError, ConsumerController};
use fpd_types::{
    BtcPublicKey, RetryPolicy,
    retry::{RetryError, retry_with_shutdown},
};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How the first height to process is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartHeightMode {
    /// Use the operator-configured height as is
    Static(u64),
    /// Derive it from local and on-chain voting progress
    Automatic,
}

/// Start height resolution errors
#[derive(Debug, Error)]
pub enum DetermineError {
    /// A chain query kept failing
    #[error("failed to query {query}: {source}")]
    Query {
        /// Query name
        query: &'static str,
        /// Last error
        source: ClientError,
    },

    /// Shutdown was requested
    #[error("start height resolution cancelled")]
    Cancelled,
}

/// Resolves the height a starting instance resumes from
#[derive(Debug, Clone)]
pub struct StartHeightDeterminer {
    client: Arc<dyn ConsumerController>,
    mode: StartHeightMode,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl StartHeightDeterminer {
    /// Create a determiner
    pub fn new(
        client: Arc<dyn ConsumerController>,
        mode: StartHeightMode,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self { client, mode, retry, shutdown }
    }

    /// First height to process.
    ///
    /// In automatic mode this is one past the highest of the local last voted
    /// height, the on-chain last voted height and the last finalized height,
    /// and never below the finality activation height.
    pub async fn determine_start_height(
        &self,
        fp_pk: BtcPublicKey,
        local_last_voted: impl FnOnce() -> u64,
    ) -> Result<u64, DetermineError> {
        if let StartHeightMode::Static(height) = self.mode {
            info!(target: "fpd::determiner", start_height = height, "Using static start height");
            return Ok(height);
        }

        let remote_last_voted = self
            .query("highest voted height", || self.client.query_highest_voted_height(fp_pk))
            .await?;
        let last_finalized = self
            .query("latest finalized block", || self.client.query_latest_finalized_block())
            .await?
            .map_or(0, |block| block.height);
        let activation_height =
            self.query("activation height", || self.client.query_activated_height()).await?;
        let local_last_voted = local_last_voted();

        let start_height = local_last_voted
            .max(remote_last_voted)
            .max(last_finalized)
            .saturating_add(1)
            .max(activation_height);

        info!(
            target: "fpd::determiner",
            %fp_pk,
            local_last_voted,
            remote_last_voted,
            last_finalized,
            activation_height,
            start_height,
            "Determined start height"
        );
        Ok(start_height)
    }

    async fn query<T, F, Fut>(&self, query: &'static str, op: F) -> Result<T, DetermineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        retry_with_shutdown(&self.retry, &self.shutdown, query, op).await.map_err(|e| match e {
            RetryError::Cancelled => DetermineError::Cancelled,
            RetryError::Failed(source) => DetermineError::Query { query, source },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use assert_matches::assert_matches;
    use fpd_devnet::{ChainOp, SimulatedChain, SimulatedChainConfig};
    use std::time::Duration;

    const PK: BtcPublicKey = B256::repeat_byte(3);

    fn setup(activation: u64, tip: u64) -> Arc<SimulatedChain> {
        Arc::new(SimulatedChain::new(SimulatedChainConfig {
            activation_height: Some(activation),
            initial_height: tip,
            ..Default::default()
        }))
    }

    fn determiner(chain: &Arc<SimulatedChain>, mode: StartHeightMode) -> StartHeightDeterminer {
        StartHeightDeterminer::new(
            chain.clone(),
            mode,
            RetryPolicy::new(3, Duration::from_millis(1)),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_static_mode_is_verbatim() {
        let chain = setup(100, 200);
        let d = determiner(&chain, StartHeightMode::Static(7));
        assert_eq!(d.determine_start_height(PK, || 150).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_floored_at_activation() {
        let chain = setup(100, 200);
        let d = determiner(&chain, StartHeightMode::Automatic);
        assert_eq!(d.determine_start_height(PK, || 0).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_highest_progress_wins() {
        let chain = setup(10, 200);
        let d = determiner(&chain, StartHeightMode::Automatic);

        // Local progress ahead of everything else
        assert_eq!(d.determine_start_height(PK, || 150).await.unwrap(), 151);

        // Finalized height ahead of local progress
        chain.finalize(180);
        assert_eq!(d.determine_start_height(PK, || 150).await.unwrap(), 181);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let chain = setup(10, 20);
        chain.inject_failures(ChainOp::HighestVoted, ClientError::Transient("busy".into()), 2);
        let d = determiner(&chain, StartHeightMode::Automatic);
        assert_eq!(d.determine_start_height(PK, || 12).await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_query_failure_surfaces() {
        let chain = setup(10, 20);
        chain.inject_failures(ChainOp::ActivatedHeight, ClientError::Transient("down".into()), 5);
        let d = determiner(&chain, StartHeightMode::Automatic);
        assert_matches!(
            d.determine_start_height(PK, || 0).await,
            Err(DetermineError::Query { query: "activation height", .. })
        );
    }
}
