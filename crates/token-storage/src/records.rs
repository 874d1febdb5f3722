//! Records persisted in the shared store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential set for one logical session.
///
/// Always written in full; a refresh replaces every field at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    /// Bearer token for backend calls.
    pub access_token: String,
    /// Token used to mint a new access token, if the session has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// When the access token stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Create a record.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expires_at,
        }
    }

    /// Returns true if the access token can be used at `now` without refreshing,
    /// i.e. it is non-empty and outlives `now + grace`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        !self.access_token.is_empty() && self.expires_at > now + grace
    }

    /// [`is_usable_at`](Self::is_usable_at) against the current time.
    pub fn is_usable(&self, grace: Duration) -> bool {
        self.is_usable_at(Utc::now(), grace)
    }

    /// Returns true if a refresh token is present.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Snapshot of the user from the last successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Subscription plan label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Monthly,
    Yearly,
}

impl Plan {
    /// Map a backend plan label onto a plan.
    ///
    /// Unknown or missing labels map to `Free`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_ascii_lowercase();
        if label.contains("year") || label.contains("annual") {
            Plan::Yearly
        } else if label.contains("month") {
            Plan::Monthly
        } else {
            Plan::Free
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Monthly => "monthly",
            Plan::Yearly => "yearly",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entitlement as reported by the backend.
///
/// `is_active` and `plan` are independent: an inactive subscription may still
/// carry a paid plan label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub is_active: bool,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
}

impl SubscriptionStatus {
    /// Inactive free plan.
    pub fn free() -> Self {
        Self::default()
    }
}

/// Canonical auth state of a process context.
///
/// Invariant: when `is_authenticated` is false there is no user and the
/// subscription is inactive. The constructors enforce it and deserialization
/// normalizes records that violate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawAuthState")]
pub struct AuthState {
    is_authenticated: bool,
    user: Option<User>,
    subscription: SubscriptionStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAuthState {
    #[serde(default)]
    is_authenticated: bool,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    subscription: SubscriptionStatus,
}

impl From<RawAuthState> for AuthState {
    fn from(raw: RawAuthState) -> Self {
        match (raw.is_authenticated, raw.user) {
            (true, Some(user)) => AuthState::authenticated(user, raw.subscription),
            _ => AuthState::unauthenticated(),
        }
    }
}

impl AuthState {
    /// Signed-out state.
    pub fn unauthenticated() -> Self {
        Self {
            is_authenticated: false,
            user: None,
            subscription: SubscriptionStatus::free(),
        }
    }

    /// Signed-in state for a verified user.
    pub fn authenticated(user: User, subscription: SubscriptionStatus) -> Self {
        Self {
            is_authenticated: true,
            user: Some(user),
            subscription,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn subscription(&self) -> &SubscriptionStatus {
        &self.subscription
    }

    /// Authenticated with an active subscription.
    pub fn is_premium(&self) -> bool {
        self.is_authenticated && self.subscription.is_active
    }

    /// Plan label, `Free` when signed out.
    pub fn plan(&self) -> Plan {
        self.subscription.plan
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::unauthenticated()
    }
}
