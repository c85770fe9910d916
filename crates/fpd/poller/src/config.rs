use fpd_types::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chain poller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Capacity of the block queue
    pub buffer_size: usize,
    /// Delay between polling cycles
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maximum number of blocks fetched per cycle
    pub poll_size: u64,
    /// Retry policy for each query within a cycle
    pub retry: RetryPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            poll_interval: Duration::from_secs(1),
            poll_size: 1000,
            retry: RetryPolicy::default(),
        }
    }
}
