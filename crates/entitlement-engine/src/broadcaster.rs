//! Fan-out of entitlement state to dependent process contexts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use token_storage::{AuthState, Plan};
use tracing::{debug, warn};

/// Entitlement summary sent to dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementPayload {
    pub is_authenticated: bool,
    pub is_premium: bool,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&AuthState> for EntitlementPayload {
    fn from(state: &AuthState) -> Self {
        Self {
            is_authenticated: state.is_authenticated(),
            is_premium: state.is_premium(),
            plan: state.plan(),
            expires_at: state.subscription().expires_at,
        }
    }
}

impl EntitlementPayload {
    /// SHA-256 of the serialized payload, hex encoded.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Message delivered to another process context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessMessage {
    EntitlementChanged(EntitlementPayload),
    /// The session is gone; the user has to sign in again.
    Reauthenticate { reason: String },
    /// An active subscription is no longer active.
    Downgraded { previous_plan: Plan, plan: Plan },
    LoggedOut,
}

impl ProcessMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessMessage::EntitlementChanged(_) => "entitlement_changed",
            ProcessMessage::Reauthenticate { .. } => "reauthenticate",
            ProcessMessage::Downgraded { .. } => "downgraded",
            ProcessMessage::LoggedOut => "logged_out",
        }
    }
}

/// Dependent process context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessTarget {
    Popup,
    ContentScripts,
    Background,
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessTarget::Popup => "popup",
            ProcessTarget::ContentScripts => "content_scripts",
            ProcessTarget::Background => "background",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MessengerError {
    /// Nobody is listening in the target context (e.g. the popup is closed).
    #[error("No receiver in {0}")]
    Unreachable(ProcessTarget),

    #[error("Send failed: {0}")]
    Send(String),
}

/// Cross-process message delivery.
#[async_trait]
pub trait ProcessMessenger: Send + Sync {
    async fn send_to_process(
        &self,
        target: ProcessTarget,
        message: ProcessMessage,
    ) -> Result<(), MessengerError>;
}

/// A message together with its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub target: ProcessTarget,
    pub message: ProcessMessage,
}

/// In-process messenger that fans envelopes out on a broadcast channel.
#[derive(Clone)]
pub struct ChannelMessenger {
    sender: broadcast::Sender<Envelope>,
}

impl ChannelMessenger {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl ProcessMessenger for ChannelMessenger {
    async fn send_to_process(
        &self,
        target: ProcessTarget,
        message: ProcessMessage,
    ) -> Result<(), MessengerError> {
        self.sender
            .send(Envelope { target, message })
            .map(|_| ())
            .map_err(|_| MessengerError::Unreachable(target))
    }
}

struct LastSend {
    digest: String,
    at: Instant,
}

/// Publishes entitlement payloads, suppressing identical sends inside the
/// cooldown window.
pub struct EntitlementBroadcaster {
    messenger: Arc<dyn ProcessMessenger>,
    targets: Vec<ProcessTarget>,
    cooldown: Duration,
    last: Mutex<Option<LastSend>>,
}

impl EntitlementBroadcaster {
    pub fn new(
        messenger: Arc<dyn ProcessMessenger>,
        targets: Vec<ProcessTarget>,
        cooldown: Duration,
    ) -> Self {
        Self {
            messenger,
            targets,
            cooldown,
            last: Mutex::new(None),
        }
    }

    /// Publish `state` to every target. Returns false when the send was
    /// suppressed as a duplicate.
    pub async fn publish(&self, state: &AuthState) -> bool {
        let payload = EntitlementPayload::from(state);
        let digest = payload.digest();
        let now = Instant::now();

        {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = last.as_ref() {
                if previous.digest == digest && now.duration_since(previous.at) < self.cooldown {
                    debug!("Entitlement unchanged inside cooldown, not publishing");
                    return false;
                }
            }
            *last = Some(LastSend { digest, at: now });
        }

        debug!(
            is_authenticated = payload.is_authenticated,
            is_premium = payload.is_premium,
            plan = %payload.plan,
            "Publishing entitlement"
        );
        self.deliver(ProcessMessage::EntitlementChanged(payload)).await;
        true
    }

    /// Send a notice to every target, without suppression.
    pub async fn notify(&self, message: ProcessMessage) {
        debug!(kind = message.kind(), "Sending notice");
        self.deliver(message).await;
    }

    async fn deliver(&self, message: ProcessMessage) {
        for target in &self.targets {
            if let Err(e) = self
                .messenger
                .send_to_process(*target, message.clone())
                .await
            {
                match e {
                    MessengerError::Unreachable(_) => {
                        debug!(target = %target, kind = message.kind(), "Target not listening")
                    }
                    other => {
                        warn!(target = %target, kind = message.kind(), error = %other, "Delivery failed")
                    }
                }
            }
        }
    }
}
