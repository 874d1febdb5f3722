//! Token lifecycle and entitlement sync engine.
//!
//! This crate provides:
//! - Token acquisition with refresh and external session recovery
//! - Supabase identity and subscription client
//! - FSM-tracked auth state with cross-process synchronization
//! - Tiered polling and deduplicated entitlement broadcasts

mod auth_fsm;
mod broadcaster;
mod error;
mod jwt;
mod poll_scheduler;
mod remote_client;
mod runtime;
mod session_scanner;
mod state_machine;
mod tabs;
mod token_acquirer;

#[cfg(test)]
mod tests;

pub use auth_fsm::entitlement_machine;
pub use auth_fsm::{
    input_for, AuthTier, EntitlementInput, EntitlementMachine, EntitlementMachineState,
};
pub use broadcaster::{
    ChannelMessenger, EntitlementBroadcaster, EntitlementPayload, Envelope, MessengerError,
    ProcessMessage, ProcessMessenger, ProcessTarget,
};
pub use error::{AuthError, AuthResult};
pub use jwt::expiry_from_jwt;
pub use poll_scheduler::{poll_interval_for, PollIntervals, PollScheduler};
pub use remote_client::{
    classify_refresh_error, classify_user_error, subscription_from_rows, IdentityBackend,
    SubscriptionRow, SupabaseAuthClient,
};
pub use runtime::{EntitlementRuntime, RuntimeRequest};
pub use session_scanner::{extract_session, ScanContext, SessionLayout, SessionScanner};
pub use state_machine::{AuthStateMachine, EngineSettings};
pub use tabs::{url_matches, SnapshotTabHost, TabError, TabHandle, TabHost, TabSnapshot};
pub use token_acquirer::{RefreshOutcome, TokenAcquirer};
