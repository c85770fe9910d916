//! Finality provider status and persisted state

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::BtcPublicKey;

/// Lifecycle status of a finality provider
///
/// ```text
/// CREATED → REGISTERED → { ACTIVE ⇄ INACTIVE } → { JAILED, SLASHED }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    /// Key created locally, not yet registered on chain
    Created,
    /// Registered on chain, no voting power observed yet
    Registered,
    /// Has voting power
    Active,
    /// Lost voting power
    Inactive,
    /// Jailed by the consumer chain
    Jailed,
    /// Slashed; permanent for this key
    Slashed,
}

impl ProviderStatus {
    /// Whether a running instance must be torn down in this status
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Jailed | Self::Slashed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Slashing is permanent. A jailed provider may only be slashed; leaving
    /// jail requires a dedicated unjail flow outside a running instance.
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Slashed, Self::Slashed) => true,
            (Self::Slashed, _) => false,
            (Self::Jailed, Self::Jailed | Self::Slashed) => true,
            (Self::Jailed, _) => false,
            (_, Self::Created) => false,
            _ => true,
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Registered => "REGISTERED",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Jailed => "JAILED",
            Self::Slashed => "SLASHED",
        };
        f.write_str(s)
    }
}

/// Persisted record of a finality provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderState {
    /// BTC public key identifying the provider
    pub btc_pk: BtcPublicKey,
    /// Consumer chain the provider votes on
    pub chain_id: String,
    /// Current lifecycle status
    pub status: ProviderStatus,
    /// Highest height a finality signature was submitted for
    pub last_voted_height: u64,
}

impl ProviderState {
    /// Create a freshly registered provider record
    pub fn new(btc_pk: BtcPublicKey, chain_id: impl Into<String>) -> Self {
        Self {
            btc_pk,
            chain_id: chain_id.into(),
            status: ProviderStatus::Registered,
            last_voted_height: 0,
        }
    }

    /// Raise the last voted height; lower values are ignored.
    ///
    /// Returns whether the stored value changed.
    pub const fn bump_last_voted_height(&mut self, height: u64) -> bool {
        if height > self.last_voted_height {
            self.last_voted_height = height;
            true
        } else {
            false
        }
    }
}
