//! High-level API for the engine's persisted records.

use crate::{AuthState, KvStore, StorageChange, StorageKeys, StorageResult, TokenRecord};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Typed access to the token and state records on a shared store.
#[derive(Clone)]
pub struct SessionVault {
    store: Arc<dyn KvStore>,
}

impl SessionVault {
    /// Create a vault over the given store.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Subscribe to changes of the underlying store.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.store.subscribe()
    }

    // ==========================================
    // Token record
    // ==========================================

    /// Read the current token record.
    ///
    /// A record that no longer parses is treated as absent.
    pub fn token_record(&self) -> StorageResult<Option<TokenRecord>> {
        self.read_record(StorageKeys::TOKEN_RECORD)
    }

    /// Replace the token record in full.
    pub fn set_token_record(&self, record: &TokenRecord) -> StorageResult<()> {
        self.store
            .set_one(StorageKeys::TOKEN_RECORD, serde_json::to_value(record)?)
    }

    /// Remove the token record.
    pub fn clear_token_record(&self) -> StorageResult<()> {
        self.store.remove(&[StorageKeys::TOKEN_RECORD])
    }

    /// Remove the token record only if it still carries `refresh_token`.
    ///
    /// Returns false when another writer already replaced the record.
    pub fn clear_token_record_if_refresh(&self, refresh_token: &str) -> StorageResult<bool> {
        match self.token_record()? {
            Some(record) if record.refresh_token.as_deref() == Some(refresh_token) => {
                self.clear_token_record()?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(true),
        }
    }

    /// Remove the token record only if it is still exactly `expected`.
    pub fn clear_token_record_if_current(&self, expected: &TokenRecord) -> StorageResult<bool> {
        match self.token_record()? {
            Some(record) if record == *expected => {
                self.clear_token_record()?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(true),
        }
    }

    // ==========================================
    // Auth state
    // ==========================================

    /// Read the persisted auth state.
    pub fn auth_state(&self) -> StorageResult<Option<AuthState>> {
        self.read_record(StorageKeys::AUTH_STATE)
    }

    /// Persist the auth state.
    pub fn set_auth_state(&self, state: &AuthState) -> StorageResult<()> {
        self.store
            .set_one(StorageKeys::AUTH_STATE, serde_json::to_value(state)?)
    }

    /// Persist the auth state unless the stored value is already equal.
    ///
    /// Returns true if a write happened.
    pub fn set_auth_state_if_changed(&self, state: &AuthState) -> StorageResult<bool> {
        if self.auth_state()?.as_ref() == Some(state) {
            return Ok(false);
        }
        self.set_auth_state(state)?;
        Ok(true)
    }

    /// Remove every record owned by the engine in one operation.
    pub fn clear_all(&self) -> StorageResult<()> {
        self.store.remove(&StorageKeys::ALL)
    }

    fn read_record<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let Some(value) = self.store.get_one(key)? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(key = %key, error = %e, "Stored record has unexpected format, ignoring");
                Ok(None)
            }
        }
    }
}
