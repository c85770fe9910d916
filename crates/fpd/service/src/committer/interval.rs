use async_trait::async_trait;
use fpd_clients::TxResponse;
use fpd_types::{MerkleProof, TypesError};
use tracing::debug;

use super::{CommitDecision, CommitError, DefaultRandomnessCommitter, RandomnessCommitter};

/// Smallest height `>= height` on the voting grid
/// `activation, activation + interval, ...`
pub const fn first_eligible_height(height: u64, activation: u64, interval: u64) -> u64 {
    if height <= activation || interval == 0 {
        return activation;
    }
    activation + (height - activation).div_ceil(interval) * interval
}

/// Highest grid height covered by commitments ending at `last_committed`,
/// or `None` when nothing at or above activation is committed
pub const fn last_voting_height(last_committed: u64, activation: u64, interval: u64) -> Option<u64> {
    if last_committed < activation || interval == 0 {
        return None;
    }
    Some(activation + (last_committed - activation) / interval * interval)
}

/// Commits one randomness value every `interval` heights from activation.
///
/// Chain queries, proof storage and submission are delegated to a
/// [`DefaultRandomnessCommitter`].
#[derive(Debug)]
pub struct IntervalRandomnessCommitter {
    inner: DefaultRandomnessCommitter,
    interval: u64,
}

impl IntervalRandomnessCommitter {
    /// Wrap `inner`, committing every `interval`-th height
    pub fn new(inner: DefaultRandomnessCommitter, interval: u64) -> Result<Self, CommitError> {
        if interval == 0 {
            return Err(CommitError::Types(TypesError::ZeroInterval));
        }
        Ok(Self { inner, interval })
    }

    /// Start height given the chain state, or `None` when enough randomness
    /// is committed.
    ///
    /// Coverage is sufficient once the last voting height with randomness
    /// reaches `tip + delay + num_pub_rand * interval`.
    fn start_height(&self, last_committed: u64, tip: u64, activation: u64) -> Option<u64> {
        let target = tip.saturating_add(self.inner.timestamping_delay_blocks());
        let Some(last_voting) = last_voting_height(last_committed, activation, self.interval)
        else {
            return Some(first_eligible_height(target.max(activation), activation, self.interval));
        };

        let span = self.inner.num_pub_rand().saturating_mul(self.interval);
        if last_voting >= target.saturating_add(span) {
            return None;
        }
        let from = last_voting.saturating_add(self.interval).max(target);
        Some(first_eligible_height(from, activation, self.interval))
    }
}

#[async_trait]
impl RandomnessCommitter for IntervalRandomnessCommitter {
    async fn should_commit(&self) -> Result<Option<CommitDecision>, CommitError> {
        let last_committed = self.inner.last_committed_height().await?;
        let tip = self.inner.tip_height().await?;
        let activation = self.inner.activation_height().await?;

        match self.start_height(last_committed, tip, activation) {
            Some(start_height) => Ok(Some(CommitDecision { start_height, tip_height: tip })),
            None => {
                debug!(
                    target: "fpd::committer",
                    last_committed,
                    tip,
                    interval = self.interval,
                    "Enough sparse public randomness committed"
                );
                Ok(None)
            }
        }
    }

    async fn commit(&self, start_height: u64) -> Result<Option<TxResponse>, CommitError> {
        let activation = self.inner.activation_height().await?;
        let next_eligible = first_eligible_height(start_height, activation, self.interval);
        if next_eligible != start_height {
            return Err(CommitError::MisalignedStart { start: start_height, next_eligible });
        }
        self.inner.commit_with_interval(start_height, self.interval).await
    }

    async fn last_committed_height(&self) -> Result<u64, CommitError> {
        self.inner.last_committed_height().await
    }

    async fn next_start_height(&self) -> Result<u64, CommitError> {
        let last_committed = self.inner.last_committed_height().await?;
        let activation = self.inner.activation_height().await?;
        Ok(match last_voting_height(last_committed, activation, self.interval) {
            Some(last_voting) => last_voting + self.interval,
            None => activation,
        })
    }

    async fn is_voting_height(&self, height: u64) -> Result<bool, CommitError> {
        let activation = self.inner.activation_height().await?;
        Ok(first_eligible_height(height, activation, self.interval) == height)
    }

    fn pub_rand_proofs(&self, heights: &[u64]) -> Result<Vec<MerkleProof>, CommitError> {
        self.inner.stored_proofs(heights)
    }

    fn interval(&self) -> u64 {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_first_eligible_height() {
        assert_eq!(first_eligible_height(103, 100, 5), 105);
        assert_eq!(first_eligible_height(105, 100, 5), 105);
        assert_eq!(first_eligible_height(80, 100, 5), 100);
        assert_eq!(first_eligible_height(106, 100, 5), 110);
    }

    #[test]
    fn test_last_voting_height() {
        assert_eq!(last_voting_height(124, 100, 5), Some(120));
        assert_eq!(last_voting_height(125, 100, 5), Some(125));
        assert_eq!(last_voting_height(99, 100, 5), None);
    }

    proptest! {
        #[test]
        fn first_eligible_is_next_grid_point(
            height in 0u64..1_000_000,
            activation in 0u64..1_000_000,
            interval in 1u64..1_000,
        ) {
            let eligible = first_eligible_height(height, activation, interval);
            prop_assert!(eligible >= height);
            prop_assert!(eligible >= activation);
            prop_assert_eq!((eligible - activation) % interval, 0);
            if height > activation {
                prop_assert!(eligible - height < interval);
            }
        }
    }

    #[test]
    fn test_sufficiency_boundary() {
        // activation 100, interval 5, num 3, tip 110, delay 0: required 125
        let h = Harness::new(100, 110);
        let committer = h.interval_committer(5);

        assert_eq!(committer.start_height(125, 110, 100), None);
        assert_eq!(committer.start_height(130, 110, 100), None);
        // 124 only covers up to 120
        assert_eq!(committer.start_height(124, 110, 100), Some(125));
        assert_eq!(committer.start_height(120, 110, 100), Some(125));
        // Nothing committed yet
        assert_eq!(committer.start_height(0, 110, 100), Some(110));
        assert_eq!(committer.start_height(0, 20, 100), Some(100));
    }

    #[test]
    fn test_sufficiency_accounts_for_delay() {
        let mut h = Harness::new(100, 110);
        h.config.timestamping_delay_blocks = 3;
        let committer = h.interval_committer(5);

        // Required 113 + 15 = 128, so 125 is short and the next start is 130
        assert_eq!(committer.start_height(125, 110, 100), Some(130));
        assert_eq!(committer.start_height(130, 110, 100), None);
        // Behind the tip: restart at the first grid height past tip + delay
        assert_eq!(committer.start_height(104, 110, 100), Some(115));
    }

    #[tokio::test]
    async fn test_commits_on_grid_only() {
        let mut h = Harness::new(100, 103);
        h.config.num_pub_rand = 4;
        let committer = h.interval_committer(5);

        let decision = committer.should_commit().await.unwrap().unwrap();
        assert_eq!(decision.start_height, 105);
        assert_matches!(
            committer.commit(107).await,
            Err(CommitError::MisalignedStart { start: 107, next_eligible: 110 })
        );

        committer.commit(105).await.unwrap().unwrap();
        let on_chain = h.chain.commitments(&h.pk);
        assert_eq!((on_chain[0].interval, on_chain[0].end_height()), (5, 120));
        assert_eq!(committer.pub_rand_proofs(&[105, 110, 115, 120]).unwrap().len(), 4);
        assert!(committer.pub_rand_proofs(&[106]).is_err());
        assert_eq!(committer.next_start_height().await.unwrap(), 125);
    }

    #[tokio::test]
    async fn test_voting_heights_follow_grid() {
        let h = Harness::new(100, 120);
        let committer = h.interval_committer(5);

        for (height, on_grid) in [(95, false), (100, true), (103, false), (115, true)] {
            assert_eq!(committer.is_voting_height(height).await.unwrap(), on_grid, "{height}");
        }
        assert!(h.dense_committer().is_voting_height(103).await.unwrap());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let h = Harness::new(1, 1);
        assert_matches!(
            IntervalRandomnessCommitter::new(h.dense_committer(), 0),
            Err(CommitError::Types(TypesError::ZeroInterval))
        );
    }
}
