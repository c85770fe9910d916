//! Public randomness commitments

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TypesError;

/// A merkle-committed batch of public randomness as recorded by the consumer chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubRandCommitment {
    /// Height of the first committed value
    pub start_height: u64,
    /// Number of committed values
    pub num_pub_rand: u64,
    /// Merkle root over the committed values
    pub commitment: B256,
    /// Spacing between committed heights (1 for dense commitments)
    pub interval: u64,
    /// Epoch in which the commitment was timestamped
    pub epoch: u64,
}

impl PubRandCommitment {
    /// Create a commitment, rejecting empty batches and a zero interval
    pub fn new(
        start_height: u64,
        num_pub_rand: u64,
        commitment: B256,
        interval: u64,
        epoch: u64,
    ) -> Result<Self, TypesError> {
        if num_pub_rand == 0 {
            return Err(TypesError::EmptyCommitment);
        }
        if interval == 0 {
            return Err(TypesError::ZeroInterval);
        }
        checked_end_height(start_height, num_pub_rand, interval)?;

        Ok(Self { start_height, num_pub_rand, commitment, interval, epoch })
    }

    /// Height of the last committed value
    pub const fn end_height(&self) -> u64 {
        self.start_height + (self.num_pub_rand - 1) * self.interval
    }

    /// Whether `height` has a committed value in this batch
    pub const fn covers(&self, height: u64) -> bool {
        height >= self.start_height &&
            height <= self.end_height() &&
            (height - self.start_height) % self.interval == 0
    }

    /// All heights covered by this commitment, in increasing order
    pub fn heights(&self) -> impl Iterator<Item = u64> + use<> {
        committed_heights(self.start_height, self.num_pub_rand, self.interval)
    }
}

/// Heights `start, start + interval, ...` for `count` values
pub fn committed_heights(start: u64, count: u64, interval: u64) -> impl Iterator<Item = u64> {
    (0..count).map(move |i| start + i * interval)
}

/// Last height of a batch, or an overflow error
pub fn checked_end_height(start: u64, count: u64, interval: u64) -> Result<u64, TypesError> {
    count
        .checked_sub(1)
        .and_then(|n| n.checked_mul(interval))
        .and_then(|span| start.checked_add(span))
        .ok_or(TypesError::HeightOverflow { start, count, interval })
}

/// The message signed by the provider's BTC key when committing randomness.
///
/// `sha256(context ∥ be64(start_height) ∥ be64(num_pub_rand) ∥ commitment)`,
/// where the context is left empty until the chain enables context signing.
pub fn commit_sign_message(
    signing_context: &str,
    start_height: u64,
    num_pub_rand: u64,
    commitment: &B256,
) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(signing_context.as_bytes());
    hasher.update(start_height.to_be_bytes());
    hasher.update(num_pub_rand.to_be_bytes());
    hasher.update(commitment);
    B256::from_slice(&hasher.finalize())
}
