//! Finality Provider Core Types
//!
//! This crate holds the data model shared by every component of the
//! finality-provider daemon:
//! - **Blocks**: descriptors observed on the consumer chain and the message
//!   that gets EOTS-signed for each of them
//! - **Randomness commitments**: merkle-committed batches of one-time nonces
//! - **Provider state**: status state machine and last voted height
//! - **Retry**: the fixed-attempt, fixed-delay retry policy used for chain I/O
//!
//! # Vote lifecycle
//!
//! ```text
//!  commit(start..end)                       vote(h)
//!  ──────────────────►  consumer chain  ◄────────────────
//!  merkle root of                           EOTS sig over
//!  pub rand[start..end]                     be64(h) ∥ hash(h)
//!                                           + pub rand[h]
//!                                           + inclusion proof
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod block;
pub mod commitment;
pub mod merkle;
pub mod provider;
pub mod retry;

pub use block::BlockDescriptor;
pub use commitment::{PubRandCommitment, commit_sign_message};
pub use merkle::{MerkleError, MerkleProof};
pub use provider::{ProviderState, ProviderStatus};
pub use retry::{RetryError, RetryPolicy};

use alloy_primitives::B256;
use thiserror::Error;

/// BIP-340 x-only public key of a finality provider.
pub type BtcPublicKey = B256;

/// A single public randomness value (the `R` of a Schnorr signature).
pub type PubRand = B256;

/// An EOTS signature (the `s` of a Schnorr signature).
pub type EotsSignature = B256;

/// Errors raised when constructing core types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// A commitment must contain at least one randomness value
    #[error("number of public randomness must be at least 1")]
    EmptyCommitment,

    /// The commitment interval must be at least 1
    #[error("commitment interval must be at least 1")]
    ZeroInterval,

    /// Height arithmetic would overflow
    #[error("height overflow: start {start}, count {count}, interval {interval}")]
    HeightOverflow {
        /// First height
        start: u64,
        /// Number of values
        count: u64,
        /// Spacing between heights
        interval: u64,
    },
}
