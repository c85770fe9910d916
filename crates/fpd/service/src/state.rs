//! Shared, persisted provider state

use fpd_clients::{ProviderStore, StoreError};
use fpd_types::{BtcPublicKey, ProviderState, ProviderStatus};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// In-memory view of a provider record, written through to the store.
///
/// Writes hit the store first so memory never runs ahead of disk.
#[derive(Debug, Clone)]
pub struct ProviderStateHandle {
    state: Arc<RwLock<ProviderState>>,
    store: Arc<dyn ProviderStore>,
}

impl ProviderStateHandle {
    /// Wrap an already stored record
    pub fn new(state: ProviderState, store: Arc<dyn ProviderStore>) -> Self {
        Self { state: Arc::new(RwLock::new(state)), store }
    }

    /// Load a record from the store
    pub fn load(store: Arc<dyn ProviderStore>, fp_pk: &BtcPublicKey) -> Result<Self, StoreError> {
        let state = store.get_provider(fp_pk)?;
        Ok(Self::new(state, store))
    }

    /// Provider public key
    pub fn btc_pk(&self) -> BtcPublicKey {
        self.state.read().btc_pk
    }

    /// Consumer chain id
    pub fn chain_id(&self) -> String {
        self.state.read().chain_id.clone()
    }

    /// Current status
    pub fn status(&self) -> ProviderStatus {
        self.state.read().status
    }

    /// Highest height a vote was submitted for
    pub fn last_voted_height(&self) -> u64 {
        self.state.read().last_voted_height
    }

    /// Copy of the whole record
    pub fn snapshot(&self) -> ProviderState {
        self.state.read().clone()
    }

    /// Persist and apply a status change.
    ///
    /// Returns `false` when the status was already `status`.
    pub fn set_status(&self, status: ProviderStatus) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        if state.status == status {
            return Ok(false);
        }
        if !state.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition { from: state.status, to: status });
        }

        self.store.set_status(&state.btc_pk, status)?;
        info!(
            target: "fpd::state",
            fp_pk = %state.btc_pk,
            from = %state.status,
            to = %status,
            "Finality provider status changed"
        );
        state.status = status;
        Ok(true)
    }

    /// Persist and apply a new last voted height; lower values are ignored
    pub fn set_last_voted_height(&self, height: u64) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if height <= state.last_voted_height {
            return Ok(());
        }
        let stored = self.store.set_last_voted_height(&state.btc_pk, height)?;
        state.bump_last_voted_height(stored);
        Ok(())
    }
}
