//! Finality Provider Collaborator Interfaces
//!
//! The daemon core talks to three kinds of collaborators, all injected as
//! trait objects:
//! - [`ConsumerController`]: queries and transactions against the consumer
//!   chain (wire encoding is up to the implementation)
//! - [`EotsManager`]: the signing service that owns the provider's keys and
//!   one-time randomness
//! - [`ProviderStore`] / [`PubRandProofStore`]: local persistence for the
//!   provider record and randomness inclusion proofs
//!
//! In-memory store implementations live in [`memory`].

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod controller;
pub mod eots;
pub mod error;
pub mod memory;
pub mod store;

pub use controller::{
    CommitPubRandRequest, ConsumerController, FinalitySigSubmission, ProviderChainStatus,
    SubmitFinalitySigsRequest, TxResponse,
};
pub use eots::EotsManager;
pub use error::{ClientError, SignerError, StoreError};
pub use memory::{MemProviderStore, MemPubRandProofStore};
pub use store::{ProviderStore, PubRandProofStore};
