//! Resolves a usable access token.
//!
//! Priority chain: cached record, then refresh, then (signed-out processes
//! only) the external session scanner. Several processes share one token
//! slot, so a refresh rejection is always checked against the store before
//! anything is cleared: another process may already have rotated the token.

use crate::remote_client::IdentityBackend;
use crate::session_scanner::SessionScanner;
use crate::{AuthError, AuthResult};
use chrono::{Duration, Utc};
use std::sync::Arc;
use token_storage::{AuthState, SessionVault, TokenRecord};
use tracing::{debug, info, warn};

/// Result of a refresh attempt.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// A usable record, either freshly minted or written by another process.
    Refreshed(TokenRecord),
    /// The session cannot be refreshed; the stale record has been cleared.
    Rejected,
    /// The refresh could not be completed right now. The record is untouched.
    Unavailable(AuthError),
}

pub struct TokenAcquirer {
    vault: SessionVault,
    backend: Arc<dyn IdentityBackend>,
    scanner: Option<SessionScanner>,
    grace: Duration,
}

impl TokenAcquirer {
    pub fn new(
        vault: SessionVault,
        backend: Arc<dyn IdentityBackend>,
        scanner: Option<SessionScanner>,
        grace: Duration,
    ) -> Self {
        Self {
            vault,
            backend,
            scanner,
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Resolve a token for the process whose current state is `current`.
    ///
    /// Returns `Ok(None)` when no credential can be found. A transient
    /// refresh failure that leaves nothing usable is returned as the error
    /// so callers keep their state instead of treating it as a sign-out.
    pub async fn get_token(&self, current: &AuthState) -> AuthResult<Option<TokenRecord>> {
        let stored = self.vault.token_record()?;

        if let Some(record) = &stored {
            if record.is_usable(self.grace) {
                return Ok(Some(record.clone()));
            }
        }

        let mut deferred = None;
        if let Some(record) = stored.as_ref().filter(|r| r.can_refresh()) {
            debug!(expires_at = %record.expires_at, "Token inside grace window, refreshing");
            match self.refresh_record(record).await? {
                RefreshOutcome::Refreshed(fresh) => return Ok(Some(fresh)),
                RefreshOutcome::Rejected => {}
                RefreshOutcome::Unavailable(e) => {
                    // Still accepted by the backend until it actually expires
                    if !record.access_token.is_empty() && record.expires_at > Utc::now() {
                        debug!(error = %e, "Refresh unavailable, using token until expiry");
                        return Ok(Some(record.clone()));
                    }
                    deferred = Some(e);
                }
            }
        }

        if !current.is_authenticated() {
            if let Some(found) = self.scan().await? {
                return Ok(Some(found));
            }
        }

        match deferred {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Refresh after the backend rejected `record` as expired, regardless of
    /// its local expiry.
    pub async fn force_refresh(&self, record: &TokenRecord) -> AuthResult<RefreshOutcome> {
        if let Some(current) = self.vault.token_record()? {
            if current != *record && current.is_usable(self.grace) {
                debug!("Token already replaced by another process");
                return Ok(RefreshOutcome::Refreshed(current));
            }
        }

        if !record.can_refresh() {
            info!("Expired token has no refresh token, discarding");
            self.vault.clear_token_record_if_current(record)?;
            return Ok(RefreshOutcome::Rejected);
        }
        self.refresh_record(record).await
    }

    async fn refresh_record(&self, record: &TokenRecord) -> AuthResult<RefreshOutcome> {
        let Some(refresh_token) = record.refresh_token.as_deref() else {
            return Ok(RefreshOutcome::Rejected);
        };

        match self.backend.refresh(refresh_token).await {
            Ok(fresh) => {
                self.vault.set_token_record(&fresh)?;
                info!(expires_at = %fresh.expires_at, "Access token refreshed");
                Ok(RefreshOutcome::Refreshed(fresh))
            }
            Err(e) if e.is_terminal() => {
                // A concurrent refresh elsewhere consumes the same refresh token
                if let Some(current) = self.vault.token_record()? {
                    if current.refresh_token.as_deref() != Some(refresh_token)
                        && current.is_usable(self.grace)
                    {
                        info!(error = %e, "Refresh rejected but another process already rotated the token");
                        return Ok(RefreshOutcome::Refreshed(current));
                    }
                }
                let cleared = self.vault.clear_token_record_if_refresh(refresh_token)?;
                warn!(error = %e, cleared, "Refresh token rejected");
                Ok(RefreshOutcome::Rejected)
            }
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "Token refresh failed, keeping record");
                Ok(RefreshOutcome::Unavailable(e))
            }
        }
    }

    async fn scan(&self) -> AuthResult<Option<TokenRecord>> {
        let Some(scanner) = &self.scanner else {
            return Ok(None);
        };
        let Some(found) = scanner.scan().await else {
            return Ok(None);
        };
        self.vault.set_token_record(&found)?;
        Ok(Some(found))
    }
}
