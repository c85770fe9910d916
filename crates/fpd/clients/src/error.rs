//! Error taxonomy shared by all collaborators

use fpd_types::{BtcPublicKey, ProviderStatus};
use thiserror::Error;

/// Errors returned by a consumer-chain client
///
/// Implementations classify chain rejections so the core can decide between
/// absorbing, retrying and giving up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Rejection that means the work is already done (duplicate signature,
    /// stale height). Absorbed without retry.
    #[error("expected chain rejection: {0}")]
    Expected(String),

    /// Rejection that no retry can fix (invalid signature, missing
    /// randomness commitment, unknown block)
    #[error("unrecoverable chain error: {0}")]
    Unrecoverable(String),

    /// RPC or query failure that may succeed on a later attempt
    #[error("{0}")]
    Transient(String),

    /// The client has been closed
    #[error("client connection closed")]
    Closed,
}

impl ClientError {
    /// Whether this rejection should be absorbed silently
    pub const fn is_expected(&self) -> bool {
        matches!(self, Self::Expected(_))
    }

    /// Whether retrying cannot help
    pub const fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_) | Self::Closed)
    }

    /// Case-insensitive substring match on the error text
    pub fn mentions(&self, needle: &str) -> bool {
        self.to_string().to_lowercase().contains(needle)
    }
}

/// Errors returned by the EOTS signing service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    /// Double-sign guard: the height was already signed with a different
    /// message
    #[error("failed precondition: height {height} already signed with a different message")]
    PreconditionFailed {
        /// The refused height
        height: u64,
    },

    /// The signer does not hold the key
    #[error("key {0} not found in signer")]
    KeyNotFound(BtcPublicKey),

    /// Any other signer failure
    #[error("signer error: {0}")]
    Other(String),
}

/// Errors returned by the local stores
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record for the provider
    #[error("finality provider {0} not found")]
    ProviderNotFound(BtcPublicKey),

    /// A record for the provider already exists
    #[error("finality provider {0} already exists")]
    ProviderExists(BtcPublicKey),

    /// No randomness proof stored for the height
    #[error("public randomness proof not found for height {height}")]
    ProofNotFound {
        /// Missing height
        height: u64,
    },

    /// The status change is not allowed by the state machine
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: ProviderStatus,
        /// Requested status
        to: ProviderStatus,
    },

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}
