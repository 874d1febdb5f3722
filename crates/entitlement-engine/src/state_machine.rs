//! Canonical auth state of one process context.
//!
//! `AuthStateMachine` owns the in-memory `AuthState` and is the only place
//! it changes. A check resolves a token, verifies it, fetches the
//! subscription and applies the outcome: persist (if changed), restart the
//! poll timer, publish. Failures that say nothing about the session
//! (network, storage) leave the state as it was.

use crate::auth_fsm::{input_for, AuthTier, EntitlementInput, EntitlementMachine};
use crate::broadcaster::{EntitlementBroadcaster, ProcessMessage, ProcessMessenger, ProcessTarget};
use crate::poll_scheduler::{poll_interval_for, PollIntervals, PollScheduler};
use crate::remote_client::IdentityBackend;
use crate::session_scanner::SessionScanner;
use crate::tabs::url_matches;
use crate::token_acquirer::{RefreshOutcome, TokenAcquirer};
use crate::{AuthError, AuthResult};
use engine_config_and_utils::Config;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use token_storage::{AuthState, Plan, SessionVault, StorageChange, StorageKeys, TokenRecord};
use tracing::{debug, error, info, warn};

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Tokens expiring within this window are refreshed before use.
    pub token_grace: chrono::Duration,
    pub poll_intervals: PollIntervals,
    pub broadcast_cooldown: Duration,
    pub bootstrap_url_pattern: String,
    pub billing_url_pattern: String,
    /// Contexts that receive entitlement updates.
    pub targets: Vec<ProcessTarget>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token_grace: chrono::Duration::seconds(config.token_grace_secs as i64),
            poll_intervals: PollIntervals::from(&config.poll),
            broadcast_cooldown: Duration::from_millis(config.broadcast_cooldown_ms),
            bootstrap_url_pattern: config.bootstrap_url_pattern.clone(),
            billing_url_pattern: config.billing_url_pattern.clone(),
            ..Self::default()
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            token_grace: chrono::Duration::seconds(config.token_grace_secs as i64),
            poll_intervals: PollIntervals::from(&config.poll),
            broadcast_cooldown: Duration::from_millis(config.broadcast_cooldown_ms),
            bootstrap_url_pattern: config.bootstrap_url_pattern,
            billing_url_pattern: config.billing_url_pattern,
            targets: vec![ProcessTarget::Popup, ProcessTarget::ContentScripts],
        }
    }
}

/// What a check found out.
enum CheckOutcome {
    NoCredential,
    Revoked { reason: String, record: TokenRecord },
    Verified(AuthState),
}

struct Inner {
    state: AuthState,
    fsm: EntitlementMachine,
}

type InFlightSlot = Mutex<Option<watch::Receiver<Option<AuthState>>>>;

/// Clears the in-flight slot when the leading check finishes or is dropped.
struct InFlightGuard<'a> {
    slot: &'a InFlightSlot,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct AuthStateMachine {
    vault: SessionVault,
    backend: Arc<dyn IdentityBackend>,
    acquirer: TokenAcquirer,
    scheduler: PollScheduler,
    broadcaster: EntitlementBroadcaster,
    settings: EngineSettings,
    inner: Mutex<Inner>,
    in_flight: InFlightSlot,
}

impl AuthStateMachine {
    /// Create a machine in the unauthenticated state. Poll ticks are sent on
    /// `ticks`; whoever owns the receiver should call [`check`](Self::check)
    /// for each.
    pub fn new(
        vault: SessionVault,
        backend: Arc<dyn IdentityBackend>,
        scanner: Option<SessionScanner>,
        messenger: Arc<dyn ProcessMessenger>,
        settings: EngineSettings,
        ticks: mpsc::Sender<Instant>,
    ) -> Self {
        let acquirer = TokenAcquirer::new(
            vault.clone(),
            Arc::clone(&backend),
            scanner,
            settings.token_grace,
        );
        let broadcaster = EntitlementBroadcaster::new(
            messenger,
            settings.targets.clone(),
            settings.broadcast_cooldown,
        );
        Self {
            vault,
            backend,
            acquirer,
            scheduler: PollScheduler::new(ticks),
            broadcaster,
            settings,
            inner: Mutex::new(Inner {
                state: AuthState::unauthenticated(),
                fsm: EntitlementMachine::new(),
            }),
            in_flight: Mutex::new(None),
        }
    }

    // ==========================================
    // Read surface
    // ==========================================

    pub fn auth_state(&self) -> AuthState {
        lock(&self.inner).state.clone()
    }

    pub fn tier(&self) -> AuthTier {
        AuthTier::from(lock(&self.inner).fsm.state())
    }

    pub fn is_premium(&self) -> bool {
        lock(&self.inner).state.is_premium()
    }

    pub fn subscription_plan(&self) -> Plan {
        lock(&self.inner).state.plan()
    }

    /// Interval of the running poll timer.
    pub fn current_interval(&self) -> Option<Duration> {
        self.scheduler.current_interval()
    }

    pub fn vault(&self) -> &SessionVault {
        &self.vault
    }

    // ==========================================
    // Lifecycle
    // ==========================================

    /// Load the persisted state so the context can render before its first
    /// round trip. No network, no write.
    pub async fn hydrate(&self) -> AuthState {
        let state = match self.vault.auth_state() {
            Ok(Some(state)) => state,
            Ok(None) => AuthState::unauthenticated(),
            Err(e) => {
                warn!(error = %e, "Could not read persisted auth state");
                AuthState::unauthenticated()
            }
        };
        self.commit(&state, input_for(&state));
        self.scheduler
            .restart(poll_interval_for(&state, &self.settings.poll_intervals));
        self.broadcaster.publish(&state).await;
        debug!(tier = self.tier().as_str(), "Hydrated auth state");
        state
    }

    /// Stop the poll timer.
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }

    // ==========================================
    // Checks
    // ==========================================

    /// Run a check and return the resulting state.
    ///
    /// Never fails: on any failure the last known-good state is returned.
    /// A call made while another check is in flight waits for that check's
    /// result instead of starting a second one.
    pub async fn check(&self) -> AuthState {
        let leader = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Ok(tx)
                }
            }
        };

        let tx = match leader {
            Ok(tx) => tx,
            Err(mut rx) => {
                debug!("Check already in flight, waiting for its result");
                return match rx.wait_for(Option::is_some).await {
                    Ok(result) => (*result).clone().unwrap_or_else(|| self.auth_state()),
                    Err(_) => self.auth_state(),
                };
            }
        };

        let _guard = InFlightGuard {
            slot: &self.in_flight,
        };
        let state = self.run_check().await;
        tx.send_replace(Some(state.clone()));
        state
    }

    /// Out-of-schedule check.
    pub async fn force_check(&self) -> AuthState {
        info!("Out-of-schedule check requested");
        self.check().await
    }

    /// Check when `url` is a sign-in or billing surface of the web app.
    pub async fn notify_navigation(&self, url: &str) -> Option<AuthState> {
        let billing = url_matches(&self.settings.billing_url_pattern, url);
        if !billing && !url_matches(&self.settings.bootstrap_url_pattern, url) {
            return None;
        }
        debug!(billing, "Navigation to web app surface");
        Some(self.check().await)
    }

    async fn run_check(&self) -> AuthState {
        let current = self.auth_state();
        match self.evaluate(&current).await {
            Ok(outcome) => self.apply(outcome).await,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Check failed transiently, keeping state");
                current
            }
            Err(e) => {
                error!(error = %e, "Check aborted, keeping state");
                current
            }
        }
    }

    async fn evaluate(&self, current: &AuthState) -> AuthResult<CheckOutcome> {
        let Some(record) = self.acquirer.get_token(current).await? else {
            return Ok(CheckOutcome::NoCredential);
        };

        match self.verify_and_fetch(&record).await {
            Ok(state) => Ok(CheckOutcome::Verified(state)),
            Err(AuthError::SessionRevoked(reason)) => Ok(CheckOutcome::Revoked { reason, record }),
            Err(AuthError::ExpiredToken) => {
                info!("Access token rejected as expired, refreshing once");
                match self.acquirer.force_refresh(&record).await? {
                    RefreshOutcome::Refreshed(fresh) => match self.verify_and_fetch(&fresh).await {
                        Ok(state) => Ok(CheckOutcome::Verified(state)),
                        Err(AuthError::SessionRevoked(reason)) => Ok(CheckOutcome::Revoked {
                            reason,
                            record: fresh,
                        }),
                        Err(e) => Err(e),
                    },
                    RefreshOutcome::Rejected => Ok(CheckOutcome::NoCredential),
                    RefreshOutcome::Unavailable(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_and_fetch(&self, record: &TokenRecord) -> AuthResult<AuthState> {
        let user = self.backend.verify(&record.access_token).await?;
        let subscription = self
            .backend
            .subscription(&record.access_token, &user)
            .await?;
        Ok(AuthState::authenticated(user, subscription))
    }

    async fn apply(&self, outcome: CheckOutcome) -> AuthState {
        let (state, input, revoked) = match outcome {
            CheckOutcome::NoCredential => (
                AuthState::unauthenticated(),
                EntitlementInput::NoCredential,
                None,
            ),
            CheckOutcome::Revoked { reason, record } => {
                if let Err(e) = self.vault.clear_token_record_if_current(&record) {
                    error!(error = %e, "Could not clear revoked token, keeping state");
                    return self.auth_state();
                }
                (
                    AuthState::unauthenticated(),
                    EntitlementInput::Revoked,
                    Some(reason),
                )
            }
            CheckOutcome::Verified(state) => {
                let input = AuthTier::of(&state).verified_input();
                (state, input, None)
            }
        };

        match self.vault.set_auth_state_if_changed(&state) {
            Ok(written) => debug!(written, "Auth state persisted"),
            Err(e) => {
                error!(error = %e, "Could not persist auth state, keeping state");
                return self.auth_state();
            }
        }

        let previous = self.commit(&state, input);
        self.transition_effects(&previous, &state).await;

        if let Some(reason) = revoked {
            warn!(reason = %reason, "Session revoked, re-authentication required");
            self.broadcaster
                .notify(ProcessMessage::Reauthenticate { reason })
                .await;
        }
        if previous.is_premium() && !state.is_premium() {
            info!(previous_plan = %previous.plan(), plan = %state.plan(), "Subscription downgraded");
            self.broadcaster
                .notify(ProcessMessage::Downgraded {
                    previous_plan: previous.plan(),
                    plan: state.plan(),
                })
                .await;
        }
        state
    }

    /// Swap in a new state and advance the tier machine. Returns the
    /// previous state.
    fn commit(&self, state: &AuthState, input: EntitlementInput) -> AuthState {
        let mut inner = lock(&self.inner);
        let from = AuthTier::from(inner.fsm.state());
        if inner.fsm.consume(&input).is_err() {
            warn!(input = ?input, from = from.as_str(), "Tier machine rejected input");
        }
        let to = AuthTier::from(inner.fsm.state());
        if from != to {
            info!(from = from.as_str(), to = to.as_str(), "Entitlement tier changed");
        }
        std::mem::replace(&mut inner.state, state.clone())
    }

    /// Interval recomputation and publish, run after every applied state.
    async fn transition_effects(&self, previous: &AuthState, state: &AuthState) {
        let interval = poll_interval_for(state, &self.settings.poll_intervals);
        if previous != state {
            debug!(interval_secs = interval.as_secs(), "State changed");
        }
        self.scheduler.restart(interval);
        self.broadcaster.publish(state).await;
    }

    // ==========================================
    // Session handoff
    // ==========================================

    /// Persist a session obtained elsewhere (e.g. the web app sign-in
    /// callback), then check it.
    pub async fn import_session(&self, record: TokenRecord) -> AuthResult<AuthState> {
        if record.access_token.trim().is_empty() {
            return Err(AuthError::InvalidSession(
                "access token is empty".to_string(),
            ));
        }
        self.vault.set_token_record(&record)?;
        info!(expires_at = %record.expires_at, "Session imported");
        Ok(self.check().await)
    }

    /// Drop every local credential and the persisted state, stop polling and
    /// tell dependents.
    pub async fn logout(&self) -> AuthResult<()> {
        self.vault.clear_all()?;
        let state = AuthState::unauthenticated();
        let previous = self.commit(&state, EntitlementInput::LoggedOut);
        self.scheduler.stop();

        info!(was_authenticated = previous.is_authenticated(), "Logged out");
        self.broadcaster.publish(&state).await;
        self.broadcaster.notify(ProcessMessage::LoggedOut).await;
        Ok(())
    }

    // ==========================================
    // Cross-process sync
    // ==========================================

    /// React to a write made to the shared store.
    ///
    /// Notifications can arrive long after later writes, so an auth state
    /// change only prompts a re-read; its payload is never adopted as is.
    pub async fn handle_store_change(&self, change: &StorageChange) {
        match change.key.as_str() {
            StorageKeys::AUTH_STATE => self.resync().await,
            StorageKeys::TOKEN_RECORD => {
                let authenticated = self.auth_state().is_authenticated();
                match (&change.new_value, authenticated) {
                    (Some(_), false) => {
                        debug!("Token written while signed out, checking");
                        self.check().await;
                    }
                    (None, true) => {
                        debug!("Token removed while signed in, checking");
                        self.check().await;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Re-read the persisted state after missing change notifications.
    pub async fn resync(&self) {
        match self.vault.auth_state() {
            Ok(state) => {
                self.adopt(state.unwrap_or_else(AuthState::unauthenticated))
                    .await
            }
            Err(e) => warn!(error = %e, "Resync failed"),
        }
    }

    /// Take over a state another context persisted: no network, no write.
    async fn adopt(&self, state: AuthState) {
        if state == self.auth_state() {
            return;
        }
        info!(
            tier = AuthTier::of(&state).as_str(),
            "Adopting auth state written by another context"
        );
        let previous = self.commit(&state, input_for(&state));
        self.transition_effects(&previous, &state).await;
    }
}
