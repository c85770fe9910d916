//! Public randomness commitment
//!
//! Two policies share one trait:
//! - [`DefaultRandomnessCommitter`]: one value per height
//! - [`IntervalRandomnessCommitter`]: one value every `interval` heights,
//!   aligned to the finality activation height
//!
//! A commitment is a merkle root over the values. Inclusion proofs are stored
//! locally before the commitment is sent, so a vote can never reference a
//! committed value whose proof was lost.

mod dense;
mod interval;

pub use dense::{DefaultRandomnessCommitter, dense_start_height};
pub use interval::{IntervalRandomnessCommitter, first_eligible_height, last_voting_height};

use async_trait::async_trait;
use fpd_clients::{ClientError, SignerError, StoreError, TxResponse};
use fpd_types::{MerkleProof, TypesError};
use std::fmt::Debug;
use thiserror::Error;

/// Outcome of [`RandomnessCommitter::should_commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitDecision {
    /// First height of the commitment to make
    pub start_height: u64,
    /// Chain tip observed when deciding
    pub tip_height: u64,
}

/// Randomness commitment errors
#[derive(Debug, Error)]
pub enum CommitError {
    /// A commitment must hold at least one value
    #[error("number of public randomness must be at least 1")]
    ZeroPubRand,

    /// The signer returned the wrong number of values
    #[error("signer returned {got} randomness values, expected {expected}")]
    RandomnessCountMismatch {
        /// Requested count
        expected: u64,
        /// Returned count
        got: usize,
    },

    /// Sparse commitments must start on an eligible height
    #[error("start height {start} is not aligned, next eligible height is {next_eligible}")]
    MisalignedStart {
        /// Requested start
        start: u64,
        /// Nearest eligible height at or above `start`
        next_eligible: u64,
    },

    /// Invalid commitment parameters
    #[error(transparent)]
    Types(#[from] TypesError),

    /// Chain query or transaction failure
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Signer failure
    #[error(transparent)]
    Signer(#[from] SignerError),

    /// Proof store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Decides when to commit randomness and makes the commitments
#[async_trait]
pub trait RandomnessCommitter: Send + Sync + Debug {
    /// Start height of the next commitment, or `None` while enough
    /// randomness is committed ahead of the tip
    async fn should_commit(&self) -> Result<Option<CommitDecision>, CommitError>;

    /// Commit `num_pub_rand` values from `start_height`.
    ///
    /// Returns `None` when the chain reports the commitment as already made.
    async fn commit(&self, start_height: u64) -> Result<Option<TxResponse>, CommitError>;

    /// Last height covered by the on-chain commitments (0 when none)
    async fn last_committed_height(&self) -> Result<u64, CommitError>;

    /// Start height a commitment following the current ones would use
    async fn next_start_height(&self) -> Result<u64, CommitError>;

    /// Stored inclusion proofs for `heights`, in the same order
    fn pub_rand_proofs(&self, heights: &[u64]) -> Result<Vec<MerkleProof>, CommitError>;

    /// Whether the commitments assign randomness to `height`
    async fn is_voting_height(&self, height: u64) -> Result<bool, CommitError>;

    /// Spacing between committed heights
    fn interval(&self) -> u64;
}
