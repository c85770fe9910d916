//! EOTS signing service interface

use alloy_primitives::Bytes;
use async_trait::async_trait;
use fpd_types::{BtcPublicKey, EotsSignature, PubRand};
use std::fmt::Debug;

use crate::SignerError;

/// The service that owns the provider's key and one-time randomness.
///
/// Randomness is derived deterministically from `(key, chain_id, height)`, so
/// asking twice for the same height returns the same value.
#[async_trait]
pub trait EotsManager: Send + Sync + Debug {
    /// Randomness for `num` heights `start, start + interval, ...`
    async fn create_randomness_pairs(
        &self,
        fp_pk: BtcPublicKey,
        chain_id: &str,
        start_height: u64,
        num: u64,
        interval: u64,
    ) -> Result<Vec<PubRand>, SignerError>;

    /// Plain Schnorr signature over `msg`
    async fn sign_schnorr(&self, fp_pk: BtcPublicKey, msg: &[u8]) -> Result<Bytes, SignerError>;

    /// One-time signature over `msg` at `height`.
    ///
    /// Must return [`SignerError::PreconditionFailed`] instead of signing a
    /// second, different message at the same height.
    async fn sign_eots(
        &self,
        fp_pk: BtcPublicKey,
        chain_id: &str,
        msg: &[u8],
        height: u64,
    ) -> Result<EotsSignature, SignerError>;
}
