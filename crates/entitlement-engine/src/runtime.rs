//! Per-process runtime.
//!
//! Whatever boots a process context creates one `EntitlementRuntime` and
//! hands it out as an `Arc`. The runtime drives its `AuthStateMachine` from
//! a single event loop over poll ticks, shared-store changes and queued
//! requests.

use crate::broadcaster::ProcessMessenger;
use crate::remote_client::IdentityBackend;
use crate::session_scanner::SessionScanner;
use crate::state_machine::{AuthStateMachine, EngineSettings};
use crate::AuthResult;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use token_storage::{AuthState, Plan, SessionVault, TokenRecord};
use tracing::{debug, info, warn};

/// Request queued for the event loop.
#[derive(Debug, Clone)]
pub enum RuntimeRequest {
    Check,
    Navigation(String),
}

struct Pending {
    ticks: mpsc::Receiver<Instant>,
    requests: mpsc::Receiver<RuntimeRequest>,
}

pub struct EntitlementRuntime {
    machine: Arc<AuthStateMachine>,
    requests: mpsc::Sender<RuntimeRequest>,
    shutdown: watch::Sender<bool>,
    pending: Mutex<Option<Pending>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EntitlementRuntime {
    pub fn new(
        vault: SessionVault,
        backend: Arc<dyn IdentityBackend>,
        scanner: Option<SessionScanner>,
        messenger: Arc<dyn ProcessMessenger>,
        settings: EngineSettings,
    ) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (request_tx, request_rx) = mpsc::channel(16);
        let (shutdown, _) = watch::channel(false);
        let machine = AuthStateMachine::new(vault, backend, scanner, messenger, settings, tick_tx);

        Self {
            machine: Arc::new(machine),
            requests: request_tx,
            shutdown,
            pending: Mutex::new(Some(Pending {
                ticks: tick_rx,
                requests: request_rx,
            })),
            task: Mutex::new(None),
        }
    }

    /// Hydrate, run the first check and start the event loop. Calling it a
    /// second time has no effect.
    pub async fn start(&self) {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(pending) = pending else {
            debug!("Runtime already started");
            return;
        };

        // Subscribe before the first read so no write is missed
        let changes = self.machine.vault().subscribe();
        self.machine.hydrate().await;

        let machine = Arc::clone(&self.machine);
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            machine.check().await;
            event_loop(machine, pending, changes, shutdown).await;
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!("Entitlement runtime started");
    }

    /// Stop the event loop and the poll timer, waiting for the loop to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.machine.shutdown();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Runtime task ended abnormally");
                }
            }
        }
        info!("Entitlement runtime stopped");
    }

    pub fn machine(&self) -> &Arc<AuthStateMachine> {
        &self.machine
    }

    pub fn auth_state(&self) -> AuthState {
        self.machine.auth_state()
    }

    pub fn is_premium(&self) -> bool {
        self.machine.is_premium()
    }

    pub fn subscription_plan(&self) -> Plan {
        self.machine.subscription_plan()
    }

    pub async fn force_check(&self) -> AuthState {
        self.machine.force_check().await
    }

    pub async fn logout(&self) -> AuthResult<()> {
        self.machine.logout().await
    }

    pub async fn import_session(&self, record: TokenRecord) -> AuthResult<AuthState> {
        self.machine.import_session(record).await
    }

    pub async fn notify_navigation(&self, url: &str) -> Option<AuthState> {
        self.machine.notify_navigation(url).await
    }

    /// Queue a request for the event loop without waiting for it.
    pub fn request(&self, request: RuntimeRequest) {
        if let Err(e) = self.requests.try_send(request) {
            debug!(error = %e, "Runtime request dropped");
        }
    }
}

async fn event_loop(
    machine: Arc<AuthStateMachine>,
    mut pending: Pending,
    mut changes: broadcast::Receiver<token_storage::StorageChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = pending.ticks.recv() => {
                debug!("Poll tick");
                machine.check().await;
            }
            Some(request) = pending.requests.recv() => match request {
                RuntimeRequest::Check => {
                    machine.force_check().await;
                }
                RuntimeRequest::Navigation(url) => {
                    machine.notify_navigation(&url).await;
                }
            },
            change = changes.recv() => match change {
                Ok(change) => machine.handle_store_change(&change).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Missed store notifications, resyncing");
                    machine.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Store change channel closed");
                    break;
                }
            },
        }
    }
    debug!("Runtime event loop exited");
}
