//! Block descriptors observed on the consumer chain

use alloy_primitives::Bytes;
use serde::{Deserialize, Serialize};

/// A block as seen by the finality provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Block height
    pub height: u64,
    /// Block (app) hash
    pub hash: Bytes,
    /// Whether the consumer chain has already finalized this block
    pub finalized: bool,
}

impl BlockDescriptor {
    /// Create a new, not yet finalized, block descriptor
    pub fn new(height: u64, hash: impl Into<Bytes>) -> Self {
        Self { height, hash: hash.into(), finalized: false }
    }

    /// The message a finality vote for this block signs.
    ///
    /// Layout is `context ∥ be64(height) ∥ hash`; an empty context yields the
    /// legacy `be64(height) ∥ hash` encoding.
    pub fn msg_to_sign(&self, signing_context: &str) -> Vec<u8> {
        let mut msg = Vec::with_capacity(signing_context.len() + 8 + self.hash.len());
        msg.extend_from_slice(signing_context.as_bytes());
        msg.extend_from_slice(&self.height.to_be_bytes());
        msg.extend_from_slice(&self.hash);
        msg
    }
}
