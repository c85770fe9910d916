//! End-to-end runs of the provider manager against the devnet chain

use alloy_primitives::B256;
use assert_matches::assert_matches;
use fpd_clients::{ClientError, MemProviderStore, MemPubRandProofStore, ProviderStore};
use fpd_devnet::{ChainOp, SimulatedChain, SimulatedChainConfig, SimulatedEotsManager};
use fpd_poller::PollerConfig;
use fpd_service::{CriticalCause, FatalError, FpdConfig, ProviderManager};
use fpd_types::{BtcPublicKey, ProviderState, ProviderStatus, RetryPolicy};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Devnet {
    chain: Arc<SimulatedChain>,
    providers: Arc<MemProviderStore>,
    manager: Arc<ProviderManager>,
    pk: BtcPublicKey,
    shutdown: CancellationToken,
}

fn config(vote_interval: Option<u64>) -> FpdConfig {
    let retry = RetryPolicy::new(3, Duration::from_millis(1));
    FpdConfig {
        num_pub_rand: 3,
        timestamping_delay_blocks: 0,
        randomness_commit_interval: Duration::from_millis(10),
        submission_retry_interval: Duration::from_millis(1),
        fast_sync_interval: Duration::from_millis(10),
        status_update_interval: Duration::from_millis(20),
        finality_vote_interval: vote_interval,
        query_retry: retry,
        poller: PollerConfig {
            buffer_size: 100,
            poll_interval: Duration::from_millis(5),
            poll_size: 100,
            retry,
        },
        ..Default::default()
    }
}

impl Devnet {
    fn new(activation: u64, tip: u64, config: FpdConfig) -> Self {
        let chain = Arc::new(SimulatedChain::new(SimulatedChainConfig {
            chain_id: config.chain_id.clone(),
            activation_height: Some(activation),
            initial_height: tip,
            ..Default::default()
        }));
        let signer = Arc::new(SimulatedEotsManager::new(B256::repeat_byte(42)));
        let pk = signer.create_key("e2e");
        chain.set_voting_power(pk, activation, true);

        let providers = Arc::new(MemProviderStore::new());
        providers.create_provider(ProviderState::new(pk, config.chain_id.clone())).unwrap();

        let shutdown = CancellationToken::new();
        let manager = Arc::new(ProviderManager::new(
            config,
            chain.clone(),
            signer,
            providers.clone(),
            Arc::new(MemPubRandProofStore::new()),
            shutdown.clone(),
        ));
        Self { chain, providers, manager, pk, shutdown }
    }

    async fn start(&self) -> JoinHandle<Result<(), FatalError>> {
        self.manager.start_finality_provider(self.pk).await.unwrap();
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.run().await })
    }

    fn last_voted_height(&self) -> u64 {
        self.providers.get_provider(&self.pk).unwrap().last_voted_height
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dense_commit_then_vote() {
    let net = Devnet::new(100, 105, config(None));
    let run = net.start().await;

    wait_for(|| !net.chain.commitments(&net.pk).is_empty()).await;
    let first = net.chain.commitments(&net.pk)[0].clone();
    assert_eq!((first.start_height, first.end_height()), (105, 107));

    net.chain.produce_block();
    wait_for(|| net.last_voted_height() >= 106).await;
    assert_eq!(net.last_voted_height(), 106);
    assert!(net.chain.votes(&net.pk).contains_key(&106));
    assert!(!net.chain.votes(&net.pk).contains_key(&105));

    let info = net.manager.provider_info(&net.pk).await.unwrap();
    assert!(info.is_running);
    assert_eq!(info.status, ProviderStatus::Active);

    net.shutdown.cancel();
    run.await.unwrap().unwrap();
    assert!(net.chain.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sparse_votes_only_on_grid() {
    let net = Devnet::new(100, 103, config(Some(5)));
    let run = net.start().await;

    wait_for(|| !net.chain.commitments(&net.pk).is_empty()).await;
    let first = net.chain.commitments(&net.pk)[0].clone();
    assert_eq!((first.start_height, first.interval, first.end_height()), (105, 5, 115));

    net.chain.produce_blocks(8);
    wait_for(|| net.last_voted_height() >= 110).await;
    let voted: Vec<u64> = net.chain.votes(&net.pk).keys().copied().collect();
    assert_eq!(voted, vec![105, 110]);

    net.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slashing_is_recorded_and_daemon_keeps_running() {
    let net = Devnet::new(1, 5, config(None));
    let run = net.start().await;

    wait_for(|| !net.chain.commitments(&net.pk).is_empty()).await;
    net.chain.slash(net.pk);

    let providers = net.providers.clone();
    let pk = net.pk;
    wait_for(|| providers.get_provider(&pk).unwrap().status == ProviderStatus::Slashed).await;
    assert!(net.manager.running_instance().await.is_none());
    assert!(!run.is_finished());

    net.shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poller_exhaustion_is_fatal() {
    let net = Devnet::new(1, 5, config(None));
    let run = net.start().await;

    net.chain.inject_failures(
        ChainOp::LatestBlock,
        ClientError::Transient("rpc unavailable".into()),
        100_000,
    );

    let res = tokio::time::timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
    assert_matches!(
        res,
        Err(FatalError::Critical(err))
            if err.fp_pk == net.pk && matches!(&err.cause, CriticalCause::Fatal(msg) if msg.contains("gave up"))
    );
    assert!(net.manager.running_instance().await.is_none());
}
