//! Entitlement tier state machine using rust-fsm.
//!
//! The machine tracks which tier the process is in. Inputs are check
//! outcomes and every input is accepted from every state.
//!
//! ```text
//! ┌─────────────────┐   VerifiedFree    ┌───────────────────┐
//! │ Unauthenticated │ ────────────────► │ AuthenticatedFree │
//! │   (initial)     │                   └─────────┬─────────┘
//! └─────────────────┘                             │ ▲
//!          ▲            VerifiedPremium  Premium  │ │ Free
//!          │                                      ▼ │
//!          │  NoCredential / Revoked  ┌──────────────────────┐
//!          └───────── LoggedOut ───── │ AuthenticatedPremium │
//!                                     └──────────────────────┘
//! ```

use rust_fsm::*;
use serde::{Deserialize, Serialize};
use token_storage::AuthState;

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub entitlement_machine(Unauthenticated)

    Unauthenticated => {
        NoCredential => Unauthenticated,
        Revoked => Unauthenticated,
        LoggedOut => Unauthenticated,
        VerifiedFree => AuthenticatedFree,
        VerifiedPremium => AuthenticatedPremium
    },
    AuthenticatedFree => {
        NoCredential => Unauthenticated,
        Revoked => Unauthenticated,
        LoggedOut => Unauthenticated,
        VerifiedFree => AuthenticatedFree,
        VerifiedPremium => AuthenticatedPremium
    },
    AuthenticatedPremium => {
        NoCredential => Unauthenticated,
        Revoked => Unauthenticated,
        LoggedOut => Unauthenticated,
        VerifiedFree => AuthenticatedFree,
        VerifiedPremium => AuthenticatedPremium
    }
}

pub use entitlement_machine::Input as EntitlementInput;
pub use entitlement_machine::State as EntitlementMachineState;
pub use entitlement_machine::StateMachine as EntitlementMachine;

/// Tier of a process context, derived from its `AuthState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthTier {
    Unauthenticated,
    Free,
    Premium,
}

impl AuthTier {
    /// Tier of a persisted or in-memory state.
    pub fn of(state: &AuthState) -> Self {
        if !state.is_authenticated() {
            AuthTier::Unauthenticated
        } else if state.subscription().is_active {
            AuthTier::Premium
        } else {
            AuthTier::Free
        }
    }

    /// Machine input that moves the machine into this tier after a
    /// successful verification.
    pub fn verified_input(self) -> EntitlementInput {
        match self {
            AuthTier::Premium => EntitlementInput::VerifiedPremium,
            AuthTier::Free | AuthTier::Unauthenticated => EntitlementInput::VerifiedFree,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthTier::Unauthenticated => "unauthenticated",
            AuthTier::Free => "free",
            AuthTier::Premium => "premium",
        }
    }
}

impl From<&EntitlementMachineState> for AuthTier {
    fn from(state: &EntitlementMachineState) -> Self {
        match state {
            EntitlementMachineState::Unauthenticated => AuthTier::Unauthenticated,
            EntitlementMachineState::AuthenticatedFree => AuthTier::Free,
            EntitlementMachineState::AuthenticatedPremium => AuthTier::Premium,
        }
    }
}

/// Input that brings a fresh machine to the tier of `state`, used when a
/// state is hydrated or adopted rather than verified.
pub fn input_for(state: &AuthState) -> EntitlementInput {
    match AuthTier::of(state) {
        AuthTier::Unauthenticated => EntitlementInput::NoCredential,
        tier => tier.verified_input(),
    }
}
