//! Shared key-value storage for the entitlement engine.
//!
//! Every process context (background, page, popup) reads and writes the same
//! store. This crate provides:
//! - The [`KvStore`] contract: atomic get, full-replace set, remove, and a
//!   change subscription
//! - **Memory**: [`MemoryKvStore`], cloneable handles over one shared map
//! - **File**: [`FileKvStore`], a JSON map file replaced atomically on write
//! - [`SessionVault`], a typed API for the credential and state records

mod file;
mod keys;
mod memory;
mod records;
mod traits;
mod vault;

pub use file::FileKvStore;
pub use keys::StorageKeys;
pub use memory::MemoryKvStore;
pub use records::{AuthState, Plan, SubscriptionStatus, TokenRecord, User};
pub use traits::{KvStore, StorageChange};
pub use vault::SessionVault;

use thiserror::Error;

/// Capacity of the change-notification channel of every store.
pub const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific storage error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encoding(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_keys_constants() {
        assert!(!StorageKeys::TOKEN_RECORD.is_empty());
        assert!(!StorageKeys::AUTH_STATE.is_empty());

        let unique: std::collections::HashSet<_> = StorageKeys::ALL.iter().collect();
        assert_eq!(unique.len(), StorageKeys::ALL.len(), "Storage keys must be unique");
    }

    #[test]
    fn test_json_error_maps_to_encoding() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let storage_err = StorageError::from(err);
        assert!(matches!(storage_err, StorageError::Encoding(_)));
    }
}
