//! Finality Provider Service
//!
//! Runs one finality provider against a consumer chain: pre-commits
//! one-time randomness and casts EOTS finality votes on new blocks.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────── FinalityProviderInstance ─────────────────────┐
//!                    │                                                                    │
//!  ChainPoller ──► block queue ──► submission loop ──► FinalitySubmitter ──► chain        │
//!                    │                 ▲      │                                           │
//!                    │  lag detector ──┘      └── fast sync (catch-up in batches)         │
//!                    │                                                                    │
//!                    │  randomness loop ──► RandomnessCommitter ──► proof store + chain   │
//!                    └──────────────────────────────┬─────────────────────────────────────┘
//!                                                   │ critical errors
//!                                                   ▼
//!                                           ProviderManager ◄── status sync timer
//! ```
//!
//! # Safety rule
//!
//! A height is never signed with two different messages. Eligibility is
//! re-checked against the last voted height immediately before signing, and
//! the signer itself refuses a conflicting second signature.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod committer;
pub mod config;
pub mod determiner;
pub mod instance;
pub mod manager;
pub mod state;
pub mod submitter;

#[cfg(test)]
mod test_utils;

pub use committer::{
    CommitDecision, CommitError, DefaultRandomnessCommitter, IntervalRandomnessCommitter,
    RandomnessCommitter,
};
pub use config::{ConfigError, FpdConfig};
pub use determiner::{DetermineError, StartHeightDeterminer, StartHeightMode};
pub use instance::{
    CriticalCause, CriticalError, FastSyncError, FastSyncResult, FinalityProviderInstance,
    InstanceError, ProviderInfo,
};
pub use manager::{FatalError, ManagerError, ProviderManager};
pub use state::ProviderStateHandle;
pub use submitter::{
    DenseRandomness, FinalitySubmissionStrategy, FinalitySubmitter, IntervalRandomness,
    SubmitError, SubmitterConfig,
};
