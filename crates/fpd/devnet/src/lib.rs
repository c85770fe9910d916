//! Finality Provider Devnet
//!
//! An in-process stand-in for a consumer chain and an EOTS signer, used by
//! the `fpd` binary for local runs and by integration tests.
//!
//! ```text
//!  spawn_block_producer ──► SimulatedChain ◄── poller / committer / submitter
//!                             │  commits: merkle roots per provider
//!                             │  votes:   proof-checked, finalize on vote
//!                             └  faults:  injected per operation
//!
//!  SimulatedEotsManager: sha256-derived randomness and signatures with a
//!  per-height double-sign guard
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod chain;
pub mod signer;

pub use chain::{ChainOp, SimulatedChain, SimulatedChainConfig, spawn_block_producer};
pub use signer::SimulatedEotsManager;
