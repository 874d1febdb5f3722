//! Identity and subscription backend.
//!
//! `IdentityBackend` is the seam the state machine and token acquirer talk
//! to. Every call is one round trip; retry policy belongs to the caller.
//! `SupabaseAuthClient` implements it against the Supabase auth and REST
//! endpoints.

use crate::jwt::{expiry_after, expiry_from_jwt};
use crate::{AuthError, AuthResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use engine_config_and_utils::Config;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration as StdDuration;
use token_storage::{Plan, SubscriptionStatus, TokenRecord, User};
use tracing::{debug, warn};

/// Error codes meaning the access token itself is no longer accepted.
const EXPIRED_TOKEN_CODES: &[&str] = &["bad_jwt", "jwt_expired", "token_expired", "PGRST301"];

/// Error codes meaning the session is gone for good.
const REVOKED_SESSION_CODES: &[&str] = &[
    "session_not_found",
    "session_expired",
    "refresh_token_not_found",
    "user_not_found",
    "user_banned",
];

/// Error codes meaning the refresh token was explicitly refused.
const REJECTED_REFRESH_CODES: &[&str] = &[
    "invalid_grant",
    "refresh_token_not_found",
    "refresh_token_already_used",
    "session_not_found",
    "session_expired",
    "user_not_found",
    "user_banned",
];

/// Lifetime assumed for a refreshed token when the response carries no expiry.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Remote identity and subscription authority.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Verify an access token and return the user it belongs to.
    async fn verify(&self, access_token: &str) -> AuthResult<User>;

    /// Fetch the subscription of a verified user.
    async fn subscription(&self, access_token: &str, user: &User) -> AuthResult<SubscriptionStatus>;

    /// Exchange a refresh token for a complete new token record.
    async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenRecord>;
}

fn summarize_response_body(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("len={},digest={}", body.len(), hex)
}

/// Error payload shapes returned by GoTrue and PostgREST.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default, alias = "msg")]
    message: Option<String>,
}

impl ErrorBody {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    /// Most specific machine-readable code in the payload.
    fn code(&self) -> Option<&str> {
        self.error_code
            .as_deref()
            .or(self.error.as_deref())
            .or_else(|| self.code.as_ref().and_then(|c| c.as_str()))
    }

    fn mentions_expired_jwt(&self) -> bool {
        self.message
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().contains("jwt expired"))
    }
}

/// Classify a non-success response from a token-authenticated endpoint.
pub fn classify_user_error(status: u16, body: &str) -> AuthError {
    let parsed = ErrorBody::parse(body);
    let code = parsed.code();

    if let Some(code) = code.filter(|c| REVOKED_SESSION_CODES.contains(c)) {
        return AuthError::SessionRevoked(code.to_string());
    }
    if code.is_some_and(|c| EXPIRED_TOKEN_CODES.contains(&c))
        || parsed.mentions_expired_jwt()
        || status == 401
    {
        return AuthError::ExpiredToken;
    }
    AuthError::Backend {
        status,
        body_summary: summarize_response_body(body),
    }
}

/// Classify a non-success response from the refresh endpoint.
pub fn classify_refresh_error(status: u16, body: &str) -> AuthError {
    let parsed = ErrorBody::parse(body);
    match parsed.code() {
        Some(code) if (400..500).contains(&status) && REJECTED_REFRESH_CODES.contains(&code) => {
            AuthError::RefreshRejected(code.to_string())
        }
        _ => AuthError::Backend {
            status,
            body_summary: summarize_response_body(body),
        },
    }
}

fn map_send_error(e: reqwest::Error) -> AuthError {
    if e.is_timeout() {
        AuthError::Timeout
    } else if e.is_connect() {
        AuthError::NetworkUnavailable
    } else {
        AuthError::Http(e)
    }
}

/// Supabase user response.
#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl From<UserResponse> for User {
    fn from(user: UserResponse) -> Self {
        User {
            id: user.id,
            email: user.email.unwrap_or_default(),
            created_at: user.created_at,
            updated_at: user.updated_at.unwrap_or(user.created_at),
        }
    }
}

/// Supabase token refresh request.
#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Supabase token refresh response.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl RefreshResponse {
    fn into_record(self, now: DateTime<Utc>) -> TokenRecord {
        let expires_at = self
            .expires_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .or_else(|| self.expires_in.and_then(|secs| expiry_after(now, secs)))
            .or_else(|| expiry_from_jwt(&self.access_token))
            .unwrap_or_else(|| now + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));
        TokenRecord::new(self.access_token, self.refresh_token, expires_at)
    }
}

#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a> {
    input_user_id: &'a str,
}

/// Row returned by the `get_subscription_status` RPC.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRow {
    #[serde(default)]
    pub subscription_status: Option<String>,
    #[serde(default)]
    pub plan_name: Option<String>,
    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
}

/// Map RPC rows onto a subscription status. No rows means free and inactive.
///
/// `active` and `trialing` count as active. The plan label is taken as-is and
/// never derived from the status.
pub fn subscription_from_rows(rows: Vec<SubscriptionRow>) -> SubscriptionStatus {
    let Some(row) = rows.into_iter().next() else {
        return SubscriptionStatus::free();
    };
    let is_active = matches!(
        row.subscription_status
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref(),
        Some("active") | Some("trialing")
    );
    SubscriptionStatus {
        is_active,
        plan: row
            .plan_name
            .as_deref()
            .map(Plan::from_label)
            .unwrap_or_default(),
        expires_at: row.current_period_end,
        subscription_id: row.subscription_id,
        customer_id: row.customer_id,
    }
}

/// Supabase implementation of [`IdentityBackend`].
#[derive(Clone)]
pub struct SupabaseAuthClient {
    http_client: reqwest::Client,
    api_url: String,
    publishable_key: String,
}

impl SupabaseAuthClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_url` - The Supabase project API URL (e.g., `https://xyz.supabase.co`)
    /// * `publishable_key` - The Supabase publishable API key
    /// * `timeout` - Per-request timeout
    pub fn new(
        api_url: impl Into<String>,
        publishable_key: impl Into<String>,
        timeout: StdDuration,
    ) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            publishable_key: publishable_key.into(),
        })
    }

    /// Create a client from the host configuration.
    pub fn from_config(config: &Config) -> AuthResult<Self> {
        let url = config
            .supabase_url()
            .map_err(|e| AuthError::Config(e.to_string()))?;
        Self::new(
            url.as_str(),
            config.supabase_publishable_key.clone(),
            StdDuration::from_secs(config.request_timeout_secs),
        )
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.api_url, path)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.api_url, function)
    }
}

#[async_trait]
impl IdentityBackend for SupabaseAuthClient {
    async fn verify(&self, access_token: &str) -> AuthResult<User> {
        let response = self
            .http_client
            .get(self.auth_url("user"))
            .header("apikey", &self.publishable_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = classify_user_error(status.as_u16(), &body);
            warn!(status = %status, error = %error, "Token verification failed");
            return Err(error);
        }

        let user: UserResponse = response
            .json()
            .await
            .map_err(|e| AuthError::UnexpectedResponse(format!("user payload: {e}")))?;
        debug!(user_id = %user.id, "Token verified");
        Ok(user.into())
    }

    async fn subscription(&self, access_token: &str, user: &User) -> AuthResult<SubscriptionStatus> {
        let response = self
            .http_client
            .post(self.rpc_url("get_subscription_status"))
            .header("apikey", &self.publishable_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Accept", "application/json")
            .json(&SubscriptionRequest {
                input_user_id: &user.id,
            })
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = classify_user_error(status.as_u16(), &body);
            warn!(status = %status, user_id = %user.id, error = %error, "Subscription lookup failed");
            return Err(error);
        }

        let rows: Vec<SubscriptionRow> = response
            .json()
            .await
            .map_err(|e| AuthError::UnexpectedResponse(format!("subscription payload: {e}")))?;
        let subscription = subscription_from_rows(rows);
        debug!(
            user_id = %user.id,
            is_active = subscription.is_active,
            plan = %subscription.plan,
            "Subscription fetched"
        );
        Ok(subscription)
    }

    async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenRecord> {
        let response = self
            .http_client
            .post(format!("{}?grant_type=refresh_token", self.auth_url("token")))
            .header("apikey", &self.publishable_key)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = classify_refresh_error(status.as_u16(), &body);
            warn!(status = %status, error = %error, "Token refresh failed");
            return Err(error);
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::UnexpectedResponse(format!("refresh payload: {e}")))?;
        let record = refreshed.into_record(Utc::now());
        debug!(expires_at = %record.expires_at, "Token refreshed");
        Ok(record)
    }
}
