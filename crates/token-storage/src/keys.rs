//! Storage key constants.

/// Storage keys shared by every process context
pub struct StorageKeys;

impl StorageKeys {
    /// Current credential set (JSON [`TokenRecord`](crate::TokenRecord))
    pub const TOKEN_RECORD: &'static str = "auth_token_record";

    /// Last resolved auth state (JSON [`AuthState`](crate::AuthState))
    pub const AUTH_STATE: &'static str = "auth_state";

    /// Every key owned by the engine, cleared together on logout.
    pub const ALL: [&'static str; 2] = [Self::TOKEN_RECORD, Self::AUTH_STATE];
}
