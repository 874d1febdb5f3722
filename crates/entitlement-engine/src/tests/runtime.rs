//! Event loop start, ticks and shutdown.

use super::harness::*;
use crate::{EntitlementRuntime, IdentityBackend, ProcessMessenger, RuntimeRequest};
use std::sync::Arc;
use std::time::Duration;
use token_storage::{AuthState, MemoryKvStore, SessionVault};

struct Setup {
    store: MemoryKvStore,
    backend: Arc<MockBackend>,
    messenger: Arc<RecordingMessenger>,
    runtime: EntitlementRuntime,
}

fn setup() -> Setup {
    let store = MemoryKvStore::new();
    let backend = Arc::new(MockBackend::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let runtime = EntitlementRuntime::new(
        SessionVault::new(Arc::new(store.clone())),
        Arc::clone(&backend) as Arc<dyn IdentityBackend>,
        None,
        Arc::clone(&messenger) as Arc<dyn ProcessMessenger>,
        test_settings(),
    );
    Setup {
        store,
        backend,
        messenger,
        runtime,
    }
}

impl Setup {
    fn vault(&self) -> SessionVault {
        SessionVault::new(Arc::new(self.store.clone()))
    }

    fn sign_in(&self) {
        self.backend.accept("at");
        self.vault()
            .set_token_record(&record("at", Some("rt"), 600))
            .unwrap();
    }
}

/// Let the runtime task make progress until `done` holds.
async fn wait_until(done: impl Fn() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn start_hydrates_then_checks() {
    let s = setup();
    s.sign_in();
    s.backend.set_subscription(premium_subscription());
    let persisted = AuthState::authenticated(test_user(), premium_subscription());
    s.vault().set_auth_state(&persisted).unwrap();

    s.runtime.start().await;
    // Rendered from storage before any round trip
    assert!(s.runtime.is_premium());
    assert_eq!(s.backend.network_calls(), 0);

    wait_until(|| s.backend.verify_count() == 1).await;
    assert_eq!(s.runtime.auth_state(), persisted);
    assert_eq!(s.messenger.entitlement_sends(), 1);
    s.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn poll_tick_runs_a_check() {
    let s = setup();
    s.sign_in();
    s.runtime.start().await;
    wait_until(|| s.backend.verify_count() == 1).await;
    assert_eq!(
        s.runtime.machine().current_interval(),
        Some(Duration::from_secs(900))
    );

    tokio::time::sleep(Duration::from_secs(901)).await;
    wait_until(|| s.backend.verify_count() == 2).await;
    s.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_polling() {
    let s = setup();
    s.sign_in();
    s.runtime.start().await;
    wait_until(|| s.backend.verify_count() == 1).await;

    s.runtime.shutdown().await;
    assert_eq!(s.runtime.machine().current_interval(), None);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(s.backend.verify_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_request_runs_a_check() {
    let s = setup();
    s.sign_in();
    s.runtime.start().await;
    wait_until(|| s.backend.verify_count() == 1).await;

    s.runtime.request(RuntimeRequest::Check);
    wait_until(|| s.backend.verify_count() == 2).await;

    s.runtime
        .request(RuntimeRequest::Navigation("https://elsewhere.example.org/".into()));
    s.runtime
        .request(RuntimeRequest::Navigation(WEB_APP_URL.into()));
    wait_until(|| s.backend.verify_count() == 3).await;
    s.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sign_in_from_another_context_is_noticed() {
    let s = setup();
    s.runtime.start().await;
    wait_until(|| s.runtime.machine().current_interval() == Some(Duration::from_secs(30))).await;
    assert!(!s.runtime.auth_state().is_authenticated());

    s.sign_in();
    wait_until(|| s.runtime.auth_state().is_authenticated()).await;
    s.runtime.shutdown().await;
}

#[tokio::test]
async fn second_start_is_ignored() {
    let s = setup();
    s.runtime.start().await;
    s.runtime.start().await;
    s.runtime.shutdown().await;
}
