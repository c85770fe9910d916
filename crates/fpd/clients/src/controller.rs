//! Consumer chain controller interface

use alloy_primitives::{B256, Bytes};
use async_trait::async_trait;
use fpd_types::{
    BlockDescriptor, BtcPublicKey, EotsSignature, MerkleProof, PubRand, PubRandCommitment,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::ClientError;

/// Result of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    /// Transaction hash
    pub tx_hash: B256,
    /// Events emitted by the transaction, as reported by the chain
    pub events: Vec<String>,
}

/// Slashing/jailing status of a provider as reported by the chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderChainStatus {
    /// Provider has been slashed
    pub slashed: bool,
    /// Provider is currently jailed
    pub jailed: bool,
}

/// Signed commitment of a randomness batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPubRandRequest {
    /// Committing provider
    pub fp_pk: BtcPublicKey,
    /// First committed height
    pub start_height: u64,
    /// Number of committed values
    pub num_pub_rand: u64,
    /// Spacing between committed heights
    pub interval: u64,
    /// Merkle root over the values
    pub commitment: B256,
    /// Schnorr signature over the commitment message
    pub signature: Bytes,
}

/// One finality vote inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalitySigSubmission {
    /// Block being voted on
    pub block: BlockDescriptor,
    /// Randomness committed for the block's height
    pub pub_rand: PubRand,
    /// Inclusion proof of `pub_rand` in its commitment
    pub proof: MerkleProof,
    /// EOTS signature over the block's signable message
    pub signature: EotsSignature,
}

/// A batch of finality votes submitted in one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitFinalitySigsRequest {
    /// Voting provider
    pub fp_pk: BtcPublicKey,
    /// Votes, in increasing height order
    pub votes: Vec<FinalitySigSubmission>,
}

/// Queries and transactions against the consumer chain
#[async_trait]
pub trait ConsumerController: Send + Sync + Debug {
    /// Latest (tip) block
    async fn query_latest_block(&self) -> Result<BlockDescriptor, ClientError>;

    /// Block at `height`
    async fn query_block(&self, height: u64) -> Result<BlockDescriptor, ClientError>;

    /// Blocks in `[start, end]`, at most `limit` of them, in increasing order
    async fn query_blocks(
        &self,
        start: u64,
        end: u64,
        limit: u64,
    ) -> Result<Vec<BlockDescriptor>, ClientError>;

    /// First height at which the chain accepts finality votes
    async fn query_activated_height(&self) -> Result<u64, ClientError>;

    /// Most recent randomness commitment of the provider, if any
    async fn query_last_pub_rand_commit(
        &self,
        fp_pk: BtcPublicKey,
    ) -> Result<Option<PubRandCommitment>, ClientError>;

    /// Whether the provider has voting power at `height`
    async fn query_has_voting_power(
        &self,
        fp_pk: BtcPublicKey,
        height: u64,
    ) -> Result<bool, ClientError>;

    /// Slashing/jailing status of the provider
    async fn query_provider_status(
        &self,
        fp_pk: BtcPublicKey,
    ) -> Result<ProviderChainStatus, ClientError>;

    /// Highest height the chain has recorded a vote from the provider for
    async fn query_highest_voted_height(&self, fp_pk: BtcPublicKey) -> Result<u64, ClientError>;

    /// Latest finalized block, if any block has been finalized
    async fn query_latest_finalized_block(&self) -> Result<Option<BlockDescriptor>, ClientError>;

    /// Whether the block at `height` is finalized
    async fn query_is_block_finalized(&self, height: u64) -> Result<bool, ClientError>;

    /// Submit a signed randomness commitment
    async fn commit_pub_rand_list(
        &self,
        req: CommitPubRandRequest,
    ) -> Result<TxResponse, ClientError>;

    /// Submit a batch of finality votes
    async fn submit_batch_finality_sigs(
        &self,
        req: SubmitFinalitySigsRequest,
    ) -> Result<TxResponse, ClientError>;

    /// Domain separator for finality vote messages
    fn finality_sig_context(&self) -> String;

    /// Domain separator for randomness commitment messages
    fn pub_rand_commit_context(&self) -> String;

    /// Close the underlying connection
    async fn close(&self) -> Result<(), ClientError>;
}
