//! `fpd start`

use alloy_primitives::B256;
use clap::Args;
use fpd_clients::{MemProviderStore, MemPubRandProofStore, ProviderStore};
use fpd_devnet::{
    SimulatedChain, SimulatedChainConfig, SimulatedEotsManager, spawn_block_producer,
};
use fpd_service::{FpdConfig, ProviderManager};
use fpd_types::ProviderState;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Start command arguments
#[derive(Debug, Args)]
pub(crate) struct StartArgs {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, short = 'c', env = "FPD_CONFIG")]
    config: Option<PathBuf>,

    /// Devnet block time in milliseconds
    #[arg(long, default_value = "1000")]
    block_time_ms: u64,

    /// Devnet finality activation height
    #[arg(long, default_value = "1")]
    activation_height: u64,

    /// Blocks the devnet starts with
    #[arg(long, default_value = "0")]
    initial_height: u64,

    /// Sign with chain-specific signing contexts
    #[arg(long)]
    context_signing: bool,

    /// Name of the provider key derived by the devnet signer
    #[arg(long, default_value = "fpd")]
    key_name: String,

    /// Seed of the devnet signer
    #[arg(long, default_value = "0x0000000000000000000000000000000000000000000000000000000000000001")]
    seed: B256,
}

impl StartArgs {
    /// Run until Ctrl-C or a fatal error
    pub(crate) async fn run(self) -> eyre::Result<()> {
        let config = match &self.config {
            Some(path) => FpdConfig::load(path)?,
            None => FpdConfig::default(),
        };
        let shutdown = CancellationToken::new();

        let chain = Arc::new(SimulatedChain::new(SimulatedChainConfig {
            chain_id: config.chain_id.clone(),
            activation_height: Some(self.activation_height),
            initial_height: self.initial_height,
            context_signing: self.context_signing,
            ..Default::default()
        }));
        let signer = Arc::new(SimulatedEotsManager::new(self.seed));
        let fp_pk = signer.create_key(&self.key_name);
        chain.set_voting_power(fp_pk, self.activation_height, true);

        let providers = Arc::new(MemProviderStore::new());
        providers.create_provider(ProviderState::new(fp_pk, config.chain_id.clone()))?;

        let producer = spawn_block_producer(
            Arc::clone(&chain),
            Duration::from_millis(self.block_time_ms),
            shutdown.clone(),
        );

        info!(
            target: "fpd::cli",
            chain_id = %config.chain_id,
            %fp_pk,
            num_pub_rand = config.num_pub_rand,
            vote_interval = ?config.finality_vote_interval,
            "Starting finality provider daemon"
        );
        let manager = ProviderManager::new(
            config,
            chain,
            signer,
            providers,
            Arc::new(MemPubRandProofStore::new()),
            shutdown.clone(),
        );
        manager.start_finality_provider(fp_pk).await?;

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!(target: "fpd::cli", "Received Ctrl-C, shutting down");
                        shutdown.cancel();
                    }
                    Err(e) => warn!(target: "fpd::cli", error = %e, "Failed to listen for Ctrl-C"),
                }
            }
        });

        let res = manager.run().await;
        shutdown.cancel();
        if let Err(e) = producer.await {
            warn!(target: "fpd::cli", error = %e, "Block producer task failed");
        }

        match res {
            Ok(()) => {
                info!(target: "fpd::cli", "Finality provider daemon stopped");
                Ok(())
            }
            Err(fatal) => {
                error!(target: "fpd::cli", error = %fatal, "Finality provider daemon failed");
                Err(fatal.into())
            }
        }
    }
}
