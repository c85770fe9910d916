//! Daemon configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration. Durations use humantime notation (`"30s"`, `"500ms"`).

use fpd_poller::PollerConfig;
use fpd_types::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::determiner::StartHeightMode;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field holds an unusable value
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// Finality provider daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FpdConfig {
    /// Consumer chain the provider votes on
    pub chain_id: String,
    /// Number of randomness values per commitment
    pub num_pub_rand: u64,
    /// Blocks a commitment needs before it is timestamped and usable
    pub timestamping_delay_blocks: u64,
    /// Maximum number of blocks per finality signature batch
    pub batch_submission_size: u64,
    /// How often the randomness loop checks whether to commit
    #[serde(with = "humantime_serde")]
    pub randomness_commit_interval: Duration,
    /// Delay between two submission attempts
    #[serde(with = "humantime_serde")]
    pub submission_retry_interval: Duration,
    /// Attempts per submission (and per randomness commit)
    pub max_submission_retries: u32,
    /// How often the lag detector compares the tip with the processed height
    #[serde(with = "humantime_serde")]
    pub fast_sync_interval: Duration,
    /// Blocks fetched per page during fast sync
    pub fast_sync_limit: u64,
    /// Lag that triggers a fast sync; 0 disables the lag detector
    pub fast_sync_gap: u64,
    /// How often the manager syncs the provider status with the chain
    #[serde(with = "humantime_serde")]
    pub status_update_interval: Duration,
    /// Height from which signed messages carry the chain's signing context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_signing_height: Option<u64>,
    /// Vote only on every n-th height from activation (sparse randomness)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finality_vote_interval: Option<u64>,
    /// Start polling at this height instead of deriving it from the chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_start_height: Option<u64>,
    /// Retry policy for chain queries
    pub query_retry: RetryPolicy,
    /// Block poller settings
    pub poller: PollerConfig,
}

impl Default for FpdConfig {
    fn default() -> Self {
        Self {
            chain_id: "fpd-devnet-1".to_string(),
            num_pub_rand: 70_000,
            timestamping_delay_blocks: 6_000,
            batch_submission_size: 1_000,
            randomness_commit_interval: Duration::from_secs(30),
            submission_retry_interval: Duration::from_secs(1),
            max_submission_retries: 20,
            fast_sync_interval: Duration::from_secs(10),
            fast_sync_limit: 10,
            fast_sync_gap: 3,
            status_update_interval: Duration::from_secs(20),
            context_signing_height: None,
            finality_vote_interval: None,
            static_start_height: None,
            query_retry: RetryPolicy::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl FpdConfig {
    /// Read, parse and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// How the poller's start height is chosen
    pub const fn start_height_mode(&self) -> StartHeightMode {
        match self.static_start_height {
            Some(height) => StartHeightMode::Static(height),
            None => StartHeightMode::Automatic,
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        if self.chain_id.is_empty() {
            return invalid("chain_id", "must not be empty");
        }
        if self.num_pub_rand == 0 {
            return invalid("num_pub_rand", "must be at least 1");
        }
        if self.batch_submission_size == 0 {
            return invalid("batch_submission_size", "must be at least 1");
        }
        if self.max_submission_retries == 0 {
            return invalid("max_submission_retries", "must be at least 1");
        }
        if self.fast_sync_limit == 0 {
            return invalid("fast_sync_limit", "must be at least 1");
        }
        if self.finality_vote_interval == Some(0) {
            return invalid("finality_vote_interval", "must be at least 1");
        }
        if self.query_retry.max_attempts == 0 {
            return invalid("query_retry.max_attempts", "must be at least 1");
        }
        if self.poller.buffer_size == 0 {
            return invalid("poller.buffer_size", "must be at least 1");
        }
        if self.poller.poll_size == 0 {
            return invalid("poller.poll_size", "must be at least 1");
        }

        for (field, interval) in [
            ("randomness_commit_interval", self.randomness_commit_interval),
            ("status_update_interval", self.status_update_interval),
            ("poller.poll_interval", self.poller.poll_interval),
        ] {
            if interval.is_zero() {
                return invalid(field, "must be greater than zero");
            }
        }
        if self.fast_sync_gap > 0 && self.fast_sync_interval.is_zero() {
            return invalid("fast_sync_interval", "must be greater than zero when fast sync is on");
        }

        Ok(())
    }
}
