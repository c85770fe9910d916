//! Consumer Chain Block Poller
//!
//! Fetches blocks sequentially from the consumer chain into a bounded,
//! ordered queue read by the finality submission loop.
//!
//! ```text
//!             every poll_interval
//!  cursor ──► latest height ──► [cursor, tip] (≤ poll_size) ──► block queue
//!     ▲                                          │                (bounded)
//!     └────────────── last returned + 1 ◄────────┘
//! ```
//!
//! A query failure counts against a failure budget of [`MAX_FAILED_CYCLES`]
//! consecutive cycles. Exhausting it stops the poller and reports a
//! [`PollerError::FailureBudgetExceeded`] on the fatal channel; deciding what
//! to do about it is left to the owner.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod config;
mod poller;

pub use config::PollerConfig;
pub use poller::{ChainPoller, PollerError};

/// Consecutive failed polling cycles tolerated before the poller gives up
pub const MAX_FAILED_CYCLES: u32 = 20;
